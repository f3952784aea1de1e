use riptide_proto::{is_well_formed_reply, CLIENT_VERSION_METHOD};
use serde_json::{json, Value};
use tracing::debug;

use crate::client::StreamClient;

impl StreamClient {
    /// Health check: asks for `web3_clientVersion` and accepts only a
    /// well-formed JSON-RPC 2.0 reply without an `error`. Never fails.
    pub async fn is_connected(&self) -> bool {
        match self.call(CLIENT_VERSION_METHOD, json!([])).await {
            Ok(reply) => accepts(reply.as_ref()),
            Err(err) => {
                debug!(target: "riptide::connection", endpoint = %self.config().endpoint(), error = %err, "liveness probe failed");
                false
            }
        }
    }
}

fn accepts(reply: Option<&Value>) -> bool {
    reply.is_some_and(is_well_formed_reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_only_clean_replies() {
        assert!(accepts(Some(&json!({"jsonrpc": "2.0", "id": 0, "result": "Geth/v1.13.0"}))));
        assert!(!accepts(None));
        assert!(!accepts(Some(&json!({"jsonrpc": "1.0", "id": 0, "result": "x"}))));
        assert!(!accepts(Some(&json!({"id": 0, "result": "x"}))));
        assert!(!accepts(Some(&json!({
            "jsonrpc": "2.0", "id": 0, "error": {"code": -1, "message": "nope"}
        }))));
    }
}
