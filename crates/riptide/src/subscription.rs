use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, trace};

type InlineFn = Arc<dyn Fn(&str, Value) + Send + Sync>;
type QueuedFn = Arc<dyn Fn(String, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// One `eth_subscription` push as seen by a channel handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub subscription: String,
    pub result: Value,
}

/// Callback invoked for every push on a subscription.
///
/// Synchronous handlers run on the read loop and must return quickly.
/// Async handlers get their own queue and task, so a slow handler delays
/// only its own subscription.
#[derive(Clone)]
pub struct SubscriptionHandler {
    kind: HandlerKind,
}

#[derive(Clone)]
enum HandlerKind {
    Inline(InlineFn),
    Queued(QueuedFn),
}

impl SubscriptionHandler {
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        Self {
            kind: HandlerKind::Inline(Arc::new(handler)),
        }
    }

    pub fn from_async<F, Fut>(handler: F) -> Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            kind: HandlerKind::Queued(Arc::new(
                move |subscription: String, result: Value| -> BoxFuture<'static, ()> {
                    Box::pin(handler(subscription, result))
                },
            )),
        }
    }

    /// Handler that forwards every push into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self::sync(move |subscription, result| {
            let _ = tx.send(SubscriptionEvent {
                subscription: subscription.to_string(),
                result,
            });
        });
        (handler, rx)
    }
}

impl fmt::Debug for SubscriptionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HandlerKind::Inline(_) => "sync",
            HandlerKind::Queued(_) => "async",
        };
        f.debug_struct("SubscriptionHandler").field("kind", &kind).finish()
    }
}

/// A live handler attached to one subscription id.
pub(crate) struct Delivery {
    subscription: String,
    active: Arc<AtomicBool>,
    route: Route,
}

enum Route {
    Inline(InlineFn),
    Queued(mpsc::UnboundedSender<Value>),
}

impl Delivery {
    /// Must run inside a tokio runtime when the handler is async.
    pub(crate) fn start(subscription: &str, handler: SubscriptionHandler) -> Self {
        let active = Arc::new(AtomicBool::new(true));
        let route = match handler.kind {
            HandlerKind::Inline(handler) => Route::Inline(handler),
            HandlerKind::Queued(handler) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
                let id = subscription.to_string();
                let live = active.clone();
                tokio::spawn(async move {
                    while let Some(result) = rx.recv().await {
                        if !live.load(Ordering::Acquire) {
                            break;
                        }
                        handler(id.clone(), result).await;
                    }
                    trace!(target: "riptide::multiplexer", subscription = %id, "handler queue drained");
                });
                Route::Queued(tx)
            }
        };
        Self {
            subscription: subscription.to_string(),
            active,
            route,
        }
    }

    pub(crate) fn deliver(&self, result: Value) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        match &self.route {
            Route::Inline(handler) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&self.subscription, result)));
                if outcome.is_err() {
                    error!(
                        target: "riptide::multiplexer",
                        subscription = %self.subscription,
                        "subscription handler panicked"
                    );
                }
            }
            Route::Queued(queue) => {
                let _ = queue.send(result);
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }
}
