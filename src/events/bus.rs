//! In-process event bus.
//!
//! A bounded Tokio broadcast channel. The SSE emitter and any diagnostics
//! subscribers attach here; the persistence sink is NOT a subscriber — the
//! engine writes through the sink before publishing, which is what gives
//! the durability-before-emit guarantee. A slow or absent subscriber never
//! blocks the producer; it just lags and re-syncs from the store.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use super::types::WorkflowEvent;

/// Bounded capacity per subscriber before lag kicks in.
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to an EventBus.
pub type SharedEventBus = Arc<EventBus>;

/// Typed pub/sub channel for workflow events.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Publishing with no subscribers
    /// is fine; the run does not depend on anyone listening.
    pub fn publish(&self, event: WorkflowEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
