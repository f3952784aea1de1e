//! In-process transport for exercising a client without a network.
//!
//! [`MemoryConnector::pair`] returns the connector and the [`MemoryServer`]
//! half that sees every frame the client writes and decides what the client
//! reads back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{Connector, FrameSink, FrameStream, Transport, TransportError};
use crate::config::ClientConfig;
use crate::error::{RpcError, RpcResult};

type Inbound = Result<Vec<u8>, TransportError>;

pub struct MemoryConnector {
    transport: Mutex<Option<Transport>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let transport: Transport = (
            Box::new(MemorySink {
                outbound: Some(to_server),
            }),
            Box::new(MemoryStream {
                inbound: from_server,
            }),
        );
        let connector = Self {
            transport: Mutex::new(Some(transport)),
            attempts: attempts.clone(),
        };
        let server = MemoryServer {
            requests: from_client,
            replies: Some(to_client),
            attempts,
        };
        (connector, server)
    }

    /// A connector whose every attempt fails as if the endpoint refused it.
    pub fn refusing() -> Self {
        Self {
            transport: Mutex::new(None),
            attempts: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ClientConfig) -> RpcResult<Transport> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.transport.lock().take().ok_or_else(|| {
            RpcError::Connection(format!("{}: connection refused", config.endpoint()))
        })
    }
}

struct MemorySink {
    outbound: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound = None;
        Ok(())
    }
}

struct MemoryStream {
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }
}

/// Server side of a [`MemoryConnector`].
pub struct MemoryServer {
    requests: mpsc::UnboundedReceiver<String>,
    replies: Option<mpsc::UnboundedSender<Inbound>>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryServer {
    /// Next request written by the client, or `None` once the client closed
    /// its side.
    pub async fn next_request(&mut self) -> Option<Value> {
        let frame = self.requests.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn push(&self, frame: Value) {
        self.push_raw(frame.to_string().into_bytes());
    }

    pub fn push_raw(&self, bytes: Vec<u8>) {
        if let Some(replies) = &self.replies {
            let _ = replies.send(Ok(bytes));
        }
    }

    pub fn reply(&self, request: &Value, result: Value) {
        self.push(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}));
    }

    pub fn reply_error(&self, request: &Value, code: i64, message: &str) {
        self.push(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": code, "message": message},
        }));
    }

    pub fn notify(&self, subscription: &str, result: Value) {
        self.push(json!({
            "jsonrpc": "2.0",
            "method": riptide_proto::SUBSCRIPTION_METHOD,
            "params": {"subscription": subscription, "result": result},
        }));
    }

    /// Delivers a transport error to the client's reader.
    pub fn fail(&self, reason: &str) {
        if let Some(replies) = &self.replies {
            let _ = replies.send(Err(TransportError::Other(reason.to_string())));
        }
    }

    /// Stops accepting frames; the client's next write fails.
    pub fn refuse_writes(&mut self) {
        self.requests.close();
    }

    /// Resolves once the client has dropped its inbound stream.
    pub async fn reader_released(&self) {
        if let Some(replies) = &self.replies {
            replies.closed().await;
        }
    }

    /// Ends the client's inbound stream as a peer close would.
    pub fn close(&mut self) {
        self.replies = None;
    }
}
