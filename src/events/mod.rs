//! Event system for session state notifications
//!
//! Provides an event bus for broadcasting session lifecycle events to the
//! UI layer and other subscribers.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Event channel capacity (ring buffer size)
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Event bus for broadcasting session events
///
/// Backed by tokio's broadcast channel. Events are delivered to all active
/// subscribers; a subscriber that falls too far behind receives a `Lagged`
/// error and misses events.
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// events are fire-and-forget notifications.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::StatusChanged {
            status: SessionStatus::Active,
        });

        match rx.recv().await.unwrap() {
            SessionEvent::StatusChanged { status } => {
                assert_eq!(status, SessionStatus::Active);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        // Must not panic or error
        bus.publish(SessionEvent::SessionEnded {
            session_id: "s1".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
