use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::SUBSCRIPTION_METHOD;

/// Shape of a decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Reply to a request; `envelope` is the whole decoded message.
    Response { id: Value, envelope: Value },
    /// `eth_subscription` push event.
    Notification { subscription: String, result: Value },
    Unrecognized(Value),
}

impl InboundFrame {
    pub fn classify(value: Value) -> Self {
        if let Some(id) = value.get("id").filter(|id| !id.is_null()) {
            let id = id.clone();
            return InboundFrame::Response {
                id,
                envelope: value,
            };
        }

        if value.get("method").and_then(Value::as_str) != Some(SUBSCRIPTION_METHOD) {
            return InboundFrame::Unrecognized(value);
        }

        let subscription = value
            .get("params")
            .and_then(|params| params.get("subscription"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        match subscription {
            Some(subscription) => {
                let result = value
                    .get("params")
                    .and_then(|params| params.get("result"))
                    .cloned()
                    .unwrap_or(Value::Null);
                InboundFrame::Notification {
                    subscription,
                    result,
                }
            }
            None => InboundFrame::Unrecognized(value),
        }
    }
}

/// The `error` member of an error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerError {
    /// Extracts the error member of `envelope`, if any. Error objects that do
    /// not follow the `{code, message}` shape are kept verbatim in `message`.
    pub fn from_envelope(envelope: &Value) -> Option<Self> {
        let error = envelope.get("error").filter(|error| !error.is_null())?;
        Some(
            serde_json::from_value::<ServerError>(error.clone()).unwrap_or_else(|_| ServerError {
                code: 0,
                message: error.to_string(),
                data: None,
            }),
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_replies_by_id() {
        let frame = InboundFrame::classify(json!({"jsonrpc": "2.0", "id": 7, "result": "0x1"}));
        match frame {
            InboundFrame::Response { id, envelope } => {
                assert_eq!(id, json!(7));
                assert_eq!(envelope["result"], "0x1");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn classifies_subscription_pushes() {
        let frame = InboundFrame::classify(json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {"subscription": "0xabc", "result": {"number": "0x10"}}
        }));
        assert_eq!(
            frame,
            InboundFrame::Notification {
                subscription: "0xabc".into(),
                result: json!({"number": "0x10"}),
            }
        );
    }

    #[test]
    fn null_id_is_not_a_response() {
        let value = json!({"jsonrpc": "2.0", "id": null, "method": "other"});
        assert_eq!(InboundFrame::classify(value.clone()), InboundFrame::Unrecognized(value));
    }

    #[test]
    fn push_without_subscription_id_is_unrecognized() {
        let value = json!({"jsonrpc": "2.0", "method": "eth_subscription", "params": {"result": 1}});
        assert_eq!(InboundFrame::classify(value.clone()), InboundFrame::Unrecognized(value));
    }

    #[test]
    fn extracts_structured_and_loose_server_errors() {
        let structured = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "boom"}});
        let err = ServerError::from_envelope(&structured).expect("error member");
        assert_eq!(err.code, -32000);
        assert_eq!(err.message, "boom");

        let loose = json!({"jsonrpc": "2.0", "id": 1, "error": "rate limited"});
        let err = ServerError::from_envelope(&loose).expect("error member");
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "\"rate limited\"");

        assert!(ServerError::from_envelope(&json!({"id": 1, "result": true})).is_none());
        assert!(ServerError::from_envelope(&json!({"id": 1, "error": null})).is_none());
    }
}
