//! Correlation tables and frame dispatch.
//!
//! Replies are matched to waiting requests by id; pushes are matched to
//! handlers by subscription id. Both tables sit behind one lock that is
//! never held across an await or while a handler runs.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use riptide_proto::{InboundFrame, ServerError};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::error::{RpcError, RpcResult};
use crate::subscription::{Delivery, SubscriptionHandler};

/// How a pending request was settled.
#[derive(Debug)]
pub(crate) enum Reply {
    Envelope(Value),
    Server(ServerError),
    /// Neither `result` nor `error` was present.
    Empty,
    ConnectionLost,
}

/// A handler waiting for the `eth_subscribe` reply that names its id.
pub(crate) struct PendingSubscription {
    pub(crate) params: Value,
    pub(crate) handler: SubscriptionHandler,
}

struct PendingRequest {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Reply>,
    subscription: Option<PendingSubscription>,
}

struct Registration {
    params: Value,
    registered_at: Instant,
    delivery: Arc<Delivery>,
}

/// Snapshot of one active subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: String,
    pub params: Value,
    pub registered_at: Instant,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<u64, PendingRequest>,
    subscriptions: HashMap<String, Registration>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct Multiplexer {
    tables: Mutex<Tables>,
}

impl Multiplexer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reserves `id`. When `subscription` is given, its handler is attached
    /// by the read loop as soon as the reply arrives, before any later push
    /// is dispatched.
    pub(crate) fn register(
        &self,
        id: u64,
        method: &str,
        subscription: Option<PendingSubscription>,
    ) -> RpcResult<oneshot::Receiver<Reply>> {
        let (slot, reply) = oneshot::channel();
        let mut tables = self.tables.lock();
        if tables.closed {
            return Err(RpcError::ConnectionClosed);
        }
        tables.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                created_at: Instant::now(),
                slot,
                subscription,
            },
        );
        Ok(reply)
    }

    /// Drops a pending id whose caller stopped waiting.
    pub(crate) fn forget(&self, id: u64) -> bool {
        self.tables.lock().pending.remove(&id).is_some()
    }

    pub(crate) fn remove_subscription(&self, subscription: &str) -> bool {
        let removed = self.tables.lock().subscriptions.remove(subscription);
        match removed {
            Some(registration) => {
                registration.delivery.stop();
                debug!(
                    target: "riptide::multiplexer",
                    subscription,
                    age = ?registration.registered_at.elapsed(),
                    "subscription removed"
                );
                true
            }
            None => false,
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.tables.lock().pending.len()
    }

    pub(crate) fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let tables = self.tables.lock();
        let mut listed: Vec<SubscriptionInfo> = tables
            .subscriptions
            .iter()
            .map(|(id, registration)| SubscriptionInfo {
                id: id.clone(),
                params: registration.params.clone(),
                registered_at: registration.registered_at,
            })
            .collect();
        listed.sort_by_key(|info| info.registered_at);
        listed
    }

    /// Routes one inbound frame. Nothing here is fatal to the read loop.
    pub(crate) fn dispatch(&self, frame: &[u8]) {
        let value = match riptide_proto::decode(frame) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "riptide::multiplexer", error = %err, "discarding undecodable frame");
                return;
            }
        };
        match InboundFrame::classify(value) {
            InboundFrame::Response { id, envelope } => self.resolve(&id, envelope),
            InboundFrame::Notification {
                subscription,
                result,
            } => self.notify(&subscription, result),
            InboundFrame::Unrecognized(value) => {
                warn!(target: "riptide::multiplexer", frame = %value, "discarding unrecognized frame");
            }
        }
    }

    fn resolve(&self, id: &Value, envelope: Value) {
        let Some(key) = request_id(id) else {
            warn!(target: "riptide::multiplexer", %id, "discarding reply with a non-numeric id");
            return;
        };
        let Some(pending) = self.tables.lock().pending.remove(&key) else {
            warn!(target: "riptide::multiplexer", id = key, "discarding reply for unknown request id");
            return;
        };

        let reply = if let Some(err) = ServerError::from_envelope(&envelope) {
            warn!(
                target: "riptide::multiplexer",
                id = key,
                method = %pending.method,
                code = err.code,
                message = %err.message,
                "server returned an error"
            );
            Reply::Server(err)
        } else if envelope.get("result").is_some() {
            Reply::Envelope(envelope)
        } else {
            warn!(
                target: "riptide::multiplexer",
                id = key,
                method = %pending.method,
                "reply carries neither result nor error"
            );
            Reply::Empty
        };
        trace!(
            target: "riptide::multiplexer",
            id = key,
            method = %pending.method,
            elapsed = ?pending.created_at.elapsed(),
            "reply correlated"
        );

        let mut attached = None;
        if let (Some(subscription), Reply::Envelope(envelope)) = (pending.subscription, &reply) {
            if let Some(sub_id) = envelope.get("result").and_then(Value::as_str) {
                self.attach(sub_id, subscription);
                attached = Some(sub_id.to_string());
            }
        }
        if pending.slot.send(reply).is_err() {
            debug!(target: "riptide::multiplexer", id = key, "caller stopped waiting for reply");
            // Nobody learned this id, so nobody could ever unsubscribe it.
            if let Some(sub_id) = attached {
                self.remove_subscription(&sub_id);
            }
        }
    }

    fn attach(&self, subscription: &str, pending: PendingSubscription) {
        let delivery = Arc::new(Delivery::start(subscription, pending.handler));
        let registration = Registration {
            params: pending.params,
            registered_at: Instant::now(),
            delivery,
        };
        let mut tables = self.tables.lock();
        if tables.closed {
            registration.delivery.stop();
            return;
        }
        if let Some(previous) = tables
            .subscriptions
            .insert(subscription.to_string(), registration)
        {
            previous.delivery.stop();
            warn!(target: "riptide::multiplexer", subscription, "subscription id reused; replacing handler");
        }
    }

    fn notify(&self, subscription: &str, result: Value) {
        let delivery = self
            .tables
            .lock()
            .subscriptions
            .get(subscription)
            .map(|registration| registration.delivery.clone());
        match delivery {
            Some(delivery) => {
                trace!(target: "riptide::multiplexer", subscription, "delivering push");
                delivery.deliver(result);
            }
            None => {
                warn!(target: "riptide::multiplexer", subscription, "discarding push for unknown subscription");
            }
        }
    }

    /// Settles every pending request as lost and drops every subscription.
    /// Later registrations fail with `ConnectionClosed`.
    pub(crate) fn fail_all(&self) -> usize {
        let (pending, subscriptions) = {
            let mut tables = self.tables.lock();
            tables.closed = true;
            (
                mem::take(&mut tables.pending),
                mem::take(&mut tables.subscriptions),
            )
        };
        let failed = pending.len();
        for (_, request) in pending {
            let _ = request.slot.send(Reply::ConnectionLost);
        }
        for (_, registration) in subscriptions {
            registration.delivery.stop();
        }
        failed
    }
}

fn request_id(id: &Value) -> Option<u64> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|text| text.parse().ok()))
}
