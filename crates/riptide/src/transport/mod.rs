//! Frame transports underneath a [`StreamClient`](crate::StreamClient).
//!
//! A [`Connector`] performs the handshake and splits the result into a
//! [`FrameSink`] owned by the writer task and a [`FrameStream`] owned by the
//! reader task. The client never touches the transport any other way.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::ClientConfig;
use crate::error::RpcResult;

pub use memory::{MemoryConnector, MemoryServer};
pub use websocket::WsConnector;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// Next data frame; `None` once the peer has closed the stream.
    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>>;
}

pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameStream>);

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> RpcResult<Transport>;
}
