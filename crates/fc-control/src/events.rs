//! Lifecycle notification channel
//!
//! Components publish [`FleetEvent`]s on a broadcast channel; the IPC server
//! forwards them to every connected operator client. Publishing never fails:
//! with no subscribers the event is simply dropped.

use tokio::sync::broadcast;

use fc_core::ipc::FleetEvent;

/// Capacity of the event channel; slow subscribers see `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Sending half of the event channel
pub type EventSender = broadcast::Sender<FleetEvent>;

/// Create a new event channel
pub fn channel() -> EventSender {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish an event, ignoring the absence of subscribers
pub fn publish(events: &EventSender, event: FleetEvent) {
    if events.send(event).is_err() {
        tracing::trace!("No event subscribers");
    }
}
