//! Broadcast bus for `ExecutionEvent`.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; a subscriber that falls behind by more than the channel
//! capacity observes `RecvError::Lagged` and loses the skipped events.

use orbin_types::event::ExecutionEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run and step state changes.
///
/// Cloning the bus clones the sender, so every clone publishes into the same
/// channel.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
