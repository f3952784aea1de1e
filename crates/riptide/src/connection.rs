//! Lifecycle of the single persistent connection behind a client.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};
use crate::multiplexer::Multiplexer;
use crate::transport::{Connector, FrameSink, FrameStream, TransportError};

const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Nothing has been attempted yet.
    Uninitialized,
    Connecting,
    Open,
    /// The last connect attempt failed; the next operation tries again.
    Failed,
    /// Torn down for good.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One frame handed to the writer task; `written` reports the send outcome.
pub(crate) struct Outbound {
    pub(crate) frame: String,
    pub(crate) written: oneshot::Sender<Result<(), TransportError>>,
}

pub(crate) type OutboundQueue = mpsc::Sender<Outbound>;

pub(crate) struct ConnectionManager {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Held for the whole connect attempt so that concurrent first callers
    /// share one attempt.
    outbound: AsyncMutex<Option<OutboundQueue>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub(crate) fn new(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        Self {
            config,
            connector,
            state: Arc::new(state),
            outbound: AsyncMutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns the writer queue, connecting first if nothing is open yet.
    pub(crate) async fn ensure_open(&self, mux: &Arc<Multiplexer>) -> RpcResult<OutboundQueue> {
        let mut outbound = self.outbound.lock().await;
        match self.state() {
            ConnectionState::Closed => return Err(RpcError::ConnectionClosed),
            ConnectionState::Open => {
                if let Some(queue) = outbound.as_ref() {
                    return Ok(queue.clone());
                }
            }
            ConnectionState::Uninitialized | ConnectionState::Connecting | ConnectionState::Failed => {}
        }

        if !self.advance(ConnectionState::Connecting) {
            return Err(RpcError::ConnectionClosed);
        }
        info!(
            target: "riptide::connection",
            endpoint = %self.config.endpoint(),
            proxy = ?self.config.proxy().map(ToString::to_string),
            "connecting"
        );
        let (sink, stream) = match self.connector.connect(&self.config).await {
            Ok(transport) => transport,
            Err(err) => {
                self.advance(ConnectionState::Failed);
                warn!(
                    target: "riptide::connection",
                    endpoint = %self.config.endpoint(),
                    error = %err,
                    "connect attempt failed"
                );
                return Err(err);
            }
        };

        let (queue, frames) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(run_writer(
            sink,
            frames,
            self.state.subscribe(),
            self.state.clone(),
            mux.clone(),
        ));
        let reader = tokio::spawn(run_reader(stream, mux.clone(), self.state.clone()));
        self.tasks.lock().extend([writer, reader]);

        // A stop() or an immediate peer close during the handshake wins.
        if !self.advance(ConnectionState::Open) {
            return Err(RpcError::ConnectionClosed);
        }
        info!(target: "riptide::connection", endpoint = %self.config.endpoint(), "connection open");
        *outbound = Some(queue.clone());
        Ok(queue)
    }

    /// Moves to `next` unless the connection is already closed.
    fn advance(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Closes the connection for good and settles everything still waiting.
    pub(crate) async fn shutdown(&self, mux: &Multiplexer) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        drop(self.outbound.lock().await.take());
        // The writer sees Closed and sends a close frame; the reader has
        // nothing left to deliver.
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let mut tasks = tasks.into_iter();
        if let Some(mut writer) = tasks.next() {
            if tokio::time::timeout(self.config.connect_timeout(), &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
        let failed = mux.fail_all();
        if previous != ConnectionState::Closed {
            info!(
                target: "riptide::connection",
                endpoint = %self.config.endpoint(),
                failed_requests = failed,
                "connection stopped"
            );
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn run_writer(
    mut sink: Box<dyn FrameSink>,
    mut frames: mpsc::Receiver<Outbound>,
    mut state: watch::Receiver<ConnectionState>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    mux: Arc<Multiplexer>,
) {
    loop {
        tokio::select! {
            next = frames.recv() => {
                let Some(Outbound { frame, written }) = next else {
                    break;
                };
                let result = sink.send(frame).await;
                let failure = result.as_ref().err().map(ToString::to_string);
                let _ = written.send(result);
                if let Some(reason) = failure {
                    teardown(&state_tx, &mux, &format!("write failed: {reason}"));
                    break;
                }
            }
            _ = async { state.wait_for(|state| *state == ConnectionState::Closed).await.map(|_| ()) } => break,
        }
    }
    if let Err(err) = sink.close().await {
        debug!(target: "riptide::connection", error = %err, "closing transport failed");
    }
}

async fn run_reader(
    mut stream: Box<dyn FrameStream>,
    mux: Arc<Multiplexer>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let mut closed = state.subscribe();
    let reason = loop {
        tokio::select! {
            next = stream.recv() => match next {
                Some(Ok(frame)) => mux.dispatch(&frame),
                Some(Err(err)) => break format!("transport error: {err}"),
                None => break "stream closed by peer".to_string(),
            },
            // Torn down elsewhere; release the read half.
            _ = closed.wait_for(|state| *state == ConnectionState::Closed) => return,
        }
    };
    teardown(&state, &mux, &reason);
}

fn teardown(state: &watch::Sender<ConnectionState>, mux: &Multiplexer, reason: &str) {
    let previous = state.send_replace(ConnectionState::Closed);
    let failed = mux.fail_all();
    if previous != ConnectionState::Closed {
        warn!(
            target: "riptide::connection",
            reason,
            failed_requests = failed,
            "connection lost"
        );
    }
}
