//! JSON-RPC 2.0 envelopes as they travel over a riptide stream.
//!
//! Kept free of any runtime so that the codec can be shared by the streaming
//! client, the probe binary, and test servers without pulling in tokio.

mod frame;

pub use frame::{InboundFrame, ServerError};

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";
pub const SUBSCRIBE_METHOD: &str = "eth_subscribe";
pub const UNSUBSCRIBE_METHOD: &str = "eth_unsubscribe";
pub const SUBSCRIPTION_METHOD: &str = "eth_subscription";
pub const CLIENT_VERSION_METHOD: &str = "web3_clientVersion";

const PREVIEW_LIMIT: usize = 256;

#[derive(Debug, Error)]
#[error("could not encode request for {method}: {source}")]
pub struct EncodeError {
    pub method: String,
    #[source]
    pub source: serde_json::Error,
}

/// Raised when inbound bytes are not JSON at all. A well-formed envelope that
/// carries an `error` member is not a decode failure.
#[derive(Debug, Error)]
#[error("could not decode {:?} (line {line}, column {column}): {source}", preview(.payload))]
pub struct DecodeError {
    pub payload: String,
    pub line: usize,
    pub column: usize,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

/// Request encoder owning the id counter for one client.
///
/// Ids start at zero, increase by one per request and are never reset, so a
/// reply can always be matched to exactly one request.
#[derive(Debug, Default)]
pub struct EnvelopeCodec {
    next_id: AtomicU64,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode_request(&self, method: &str, params: Value) -> Result<(u64, Vec<u8>), EncodeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = match params {
            Value::Null => Value::Array(Vec::new()),
            other => other,
        };
        let envelope = RequestEnvelope {
            jsonrpc: JSONRPC_VERSION,
            method,
            params: &params,
            id,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|source| EncodeError {
            method: method.to_string(),
            source,
        })?;
        Ok((id, bytes))
    }

    /// Id the next `encode_request` call will hand out.
    pub fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError {
        payload: String::from_utf8_lossy(bytes).into_owned(),
        line: source.line(),
        column: source.column(),
        source,
    })
}

/// True for a JSON-RPC 2.0 envelope without an `error` member.
pub fn is_well_formed_reply(envelope: &Value) -> bool {
    envelope.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION)
        && envelope.get("error").is_none()
}

fn preview(payload: &str) -> &str {
    match payload.char_indices().nth(PREVIEW_LIMIT) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}
