//! In-process publish/subscribe bus for event-triggered workflows (C2).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

/// One published event.
#[derive(Debug, Clone)]
pub struct Event {
    /// The event's origin (e.g. `"email"`, `"manual"`).
    pub source: String,
    /// The event's kind within its source (e.g. `"message_received"`).
    pub event_type: String,
    /// Arbitrary event payload.
    pub payload: Value,
}

/// A handler invoked on a matching publication. Handlers must return
/// quickly — the Bus does not wait for them.
pub type Handler = Arc<dyn Fn(Event) + Send + Sync>;

struct Subscription {
    id: String,
    source: String,
    event_type: String,
    handler: Handler,
}

/// Subscribe/unsubscribe/publish with subscription-order fan-out.
/// `publish` is fire-and-forget: handlers run on their own spawned task so a
/// slow handler never blocks the publisher or other subscribers.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    /// An empty bus with no subscribers.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe `handler` to `(source, event_type)` under `id`. Calling
    /// again with the same `id` replaces the prior subscription in place,
    /// preserving its position in subscription order.
    pub async fn subscribe(
        &self,
        source: impl Into<String>,
        event_type: impl Into<String>,
        id: impl Into<String>,
        handler: Handler,
    ) {
        let id = id.into();
        let source = source.into();
        let event_type = event_type.into();
        let mut subscriptions = self.subscriptions.lock().await;

        if let Some(existing) = subscriptions.iter_mut().find(|s| s.id == id) {
            existing.source = source;
            existing.event_type = event_type;
            existing.handler = handler;
            return;
        }

        subscriptions.push(Subscription {
            id,
            source,
            event_type,
            handler,
        });
    }

    /// Remove every subscription registered under `id`. A no-op if absent.
    pub async fn unsubscribe(&self, id: &str) {
        self.subscriptions.lock().await.retain(|s| s.id != id);
    }

    /// Invoke every handler whose `(source, event_type)` matches `event`, in
    /// subscription order. Each handler runs on its own spawned task.
    pub async fn publish(&self, event: Event) {
        let subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions
            .iter()
            .filter(|s| s.source == event.source && s.event_type == event.event_type)
        {
            let handler = subscription.handler.clone();
            let event = event.clone();
            tokio::spawn(async move { handler(event) });
        }
    }

    /// The number of active subscriptions, for diagnostics and tests.
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }
}
