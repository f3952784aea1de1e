use std::fmt;
use std::sync::Arc;

use riptide_proto::{EnvelopeCodec, SUBSCRIBE_METHOD, UNSUBSCRIBE_METHOD};
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState, Outbound};
use crate::error::{RpcError, RpcResult};
use crate::multiplexer::{Multiplexer, PendingSubscription, Reply, SubscriptionInfo};
use crate::subscription::SubscriptionHandler;
use crate::transport::{Connector, WsConnector};

/// JSON-RPC client multiplexing requests and subscriptions over one
/// persistent stream.
///
/// Nothing touches the network until [`start`](Self::start) or the first
/// request. Clones share the same connection.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    codec: EnvelopeCodec,
    connection: ConnectionManager,
    mux: Arc<Multiplexer>,
}

impl StreamClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec: EnvelopeCodec::new(),
                connection: ConnectionManager::new(config, connector),
                mux: Arc::new(Multiplexer::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.inner.connection.config()
    }

    /// Connects now instead of on first use.
    pub async fn start(&self) -> RpcResult<()> {
        self.inner.connection.ensure_open(&self.inner.mux).await?;
        Ok(())
    }

    /// Closes the connection. Waiting requests fail with `ConnectionClosed`,
    /// as does everything issued afterwards.
    pub async fn stop(&self) {
        self.inner.connection.shutdown(&self.inner.mux).await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch_state()
    }

    /// Sends `method` and returns the whole reply envelope.
    ///
    /// A reply carrying an `error` member resolves to `Ok(None)`; use
    /// [`request`](Self::request) to see the server error instead.
    pub async fn call(&self, method: &str, params: Value) -> RpcResult<Option<Value>> {
        match self.exchange(method, params, None).await? {
            Reply::Envelope(envelope) => Ok(Some(envelope)),
            Reply::Server(_) | Reply::Empty => Ok(None),
            Reply::ConnectionLost => Err(RpcError::ConnectionClosed),
        }
    }

    /// Sends `method` and returns its `result`, surfacing server errors as
    /// [`RpcError::Server`].
    pub async fn request(&self, method: &str, params: Value) -> RpcResult<Value> {
        match self.exchange(method, params, None).await? {
            Reply::Envelope(mut envelope) => Ok(envelope
                .get_mut("result")
                .map(Value::take)
                .unwrap_or(Value::Null)),
            Reply::Server(err) => Err(RpcError::Server(err)),
            Reply::Empty => Err(RpcError::Protocol(format!(
                "reply to {method} carries neither result nor error"
            ))),
            Reply::ConnectionLost => Err(RpcError::ConnectionClosed),
        }
    }

    /// Issues `eth_subscribe` and routes every push for the returned id to
    /// `handler` until [`unsubscribe`](Self::unsubscribe) or teardown.
    pub async fn subscribe(&self, params: Value, handler: SubscriptionHandler) -> RpcResult<String> {
        let pending = PendingSubscription {
            params: params.clone(),
            handler,
        };
        let envelope = match self.exchange(SUBSCRIBE_METHOD, params, Some(pending)).await? {
            Reply::Envelope(envelope) => envelope,
            Reply::Server(err) => {
                return Err(RpcError::Protocol(format!("{SUBSCRIBE_METHOD} was rejected: {err}")))
            }
            Reply::Empty => {
                return Err(RpcError::Protocol(format!("{SUBSCRIBE_METHOD} returned no result")))
            }
            Reply::ConnectionLost => return Err(RpcError::ConnectionClosed),
        };
        let subscription = envelope
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                RpcError::Protocol(format!(
                    "{SUBSCRIBE_METHOD} result is not a subscription id: {envelope}"
                ))
            })?
            .to_string();
        info!(target: "riptide::multiplexer", subscription = %subscription, "subscribed");
        Ok(subscription)
    }

    /// Issues `eth_unsubscribe` and drops the local handler whatever the
    /// server answers. Returns the server's boolean `result`.
    pub async fn unsubscribe(&self, subscription: &str) -> RpcResult<bool> {
        let outcome = self.call(UNSUBSCRIBE_METHOD, json!([subscription])).await;
        if !self.inner.mux.remove_subscription(subscription) {
            debug!(target: "riptide::multiplexer", subscription, "no local handler to remove");
        }
        let envelope = outcome?;
        Ok(envelope
            .as_ref()
            .and_then(|envelope| envelope.get("result"))
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.mux.subscriptions()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.mux.pending_len()
    }

    async fn exchange(
        &self,
        method: &str,
        params: Value,
        subscription: Option<PendingSubscription>,
    ) -> RpcResult<Reply> {
        let queue = self.inner.connection.ensure_open(&self.inner.mux).await?;
        let (id, bytes) = self.inner.codec.encode_request(method, params)?;
        let frame = String::from_utf8(bytes)
            .map_err(|err| RpcError::Protocol(format!("encoded {method} is not UTF-8: {err}")))?;
        let subscribes = subscription.is_some();
        let mut in_flight = InFlight {
            mux: &self.inner.mux,
            id,
            subscribes,
            reply: self.inner.mux.register(id, method, subscription)?,
            settled: false,
        };
        debug!(target: "riptide::multiplexer", id, method, "sending request");

        let limit = self.config().request_timeout();
        let deadline = Instant::now() + limit;
        let waiting = &mut in_flight.reply;
        let exchange = async {
            let (written, write_outcome) = oneshot::channel();
            queue
                .send(Outbound { frame, written })
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
            match write_outcome.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(RpcError::Connection(format!("write failed: {err}"))),
                Err(_) => return Err(RpcError::ConnectionClosed),
            }
            waiting.await.map_err(|_| RpcError::ConnectionClosed)
        };

        let outcome = tokio::time::timeout_at(deadline, exchange).await;
        match outcome {
            Ok(Ok(reply)) => {
                in_flight.settled = true;
                Ok(reply)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(target: "riptide::multiplexer", id, method, timeout = ?limit, "request timed out");
                Err(RpcError::RequestTimeout {
                    method: method.to_string(),
                    id,
                    timeout: limit,
                })
            }
        }
    }
}

/// A registered request id. Dropping it before the reply was taken releases
/// the id and any subscription the read loop already attached for it.
struct InFlight<'a> {
    mux: &'a Multiplexer,
    id: u64,
    subscribes: bool,
    reply: oneshot::Receiver<Reply>,
    settled: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.mux.forget(self.id);
        if !self.subscribes {
            return;
        }
        if let Ok(Reply::Envelope(envelope)) = self.reply.try_recv() {
            if let Some(subscription) = envelope.get("result").and_then(Value::as_str) {
                self.mux.remove_subscription(subscription);
                debug!(
                    target: "riptide::multiplexer",
                    id = self.id,
                    subscription,
                    "dropped subscription nobody is waiting for"
                );
            }
        }
    }
}

impl fmt::Display for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WS connection {}", self.config().endpoint())
    }
}

impl fmt::Debug for StreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.config().endpoint().as_str())
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}
