use std::time::Duration;

use riptide_proto::{DecodeError, EncodeError, ServerError};
use riptide_tunnel::TunnelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("proxy connect failed: {0}")]
    ProxyConnect(#[from] TunnelError),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("{method} (id {id}) timed out after {timeout:?}")]
    RequestTimeout {
        method: String,
        id: u64,
        timeout: Duration,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Server(ServerError),
}

pub type RpcResult<T> = Result<T, RpcError>;
