/// Event bus for pub/sub messaging
///
/// Every automation group publishes onto one bus; the console and the tests
/// subscribe to it.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;

use super::events::Event;

/// Subscriber ID for tracking subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(usize);

/// Event subscriber
struct Subscriber {
    id: SubscriberId,
    sender: Sender<Event>,
}

/// Event bus for broadcasting events to subscribers
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
    next_id: Arc<AtomicUsize>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe to events, returns a receiver and subscription ID
    pub fn subscribe(&self) -> (Receiver<Event>, SubscriberId) {
        let (tx, rx) = unbounded();

        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber { id, sender: tx });

        (rx, id)
    }

    /// Unsubscribe from events
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.write().retain(|s| s.id != id);
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: Event) {
        let subscribers = self.subscribers.read();

        // A closed channel just means that subscriber went away
        for subscriber in subscribers.iter() {
            let _ = subscriber.sender.try_send(event.clone());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StopReason;

    #[test]
    fn test_event_bus_unsubscribe() {
        let bus = EventBus::new();
        let (rx, id) = bus.subscribe();
        let (live, _id2) = bus.subscribe();

        bus.unsubscribe(id);
        bus.publish(Event::Shutdown);

        // The sender was dropped with the subscription
        assert!(rx.try_recv().is_err());
        assert!(live.try_recv().is_ok());
    }

    #[test]
    fn test_event_bus_publish() {
        let bus = EventBus::new();
        let (rx, _id) = bus.subscribe();

        bus.publish(Event::Stopped {
            group: "daily".into(),
            reason: StopReason::InactivityTimeout,
        });

        match rx.try_recv().unwrap() {
            Event::Stopped { group, reason } => {
                assert_eq!(group, "daily");
                assert_eq!(reason, StopReason::InactivityTimeout);
            }
            other => panic!("Wrong event type received: {other:?}"),
        }
    }

    #[test]
    fn test_publish_survives_dropped_receiver() {
        let bus = EventBus::new();
        let (rx, _id) = bus.subscribe();
        let (live, _id2) = bus.subscribe();
        drop(rx);

        bus.publish(Event::Shutdown);
        assert!(matches!(live.try_recv(), Ok(Event::Shutdown)));
    }

    #[test]
    fn test_event_bus_multiple_subscribers() {
        let bus = EventBus::new();
        let (rx1, id1) = bus.subscribe();
        let (rx2, id2) = bus.subscribe();
        assert_ne!(id1, id2);

        bus.publish(Event::Shutdown);

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_event_bus_clone() {
        let bus1 = EventBus::new();
        let bus2 = bus1.clone();

        let (rx, _id) = bus1.subscribe();
        bus2.publish(Event::Shutdown); // Shared state
        assert!(matches!(rx.try_recv(), Ok(Event::Shutdown)));
    }
}
