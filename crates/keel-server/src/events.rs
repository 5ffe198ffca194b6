//! Process-wide servant event bus.
//!
//! Delivery is synchronous and listeners are held weakly: a registry that has
//! been dropped simply stops receiving events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use keel_protocol::Identity;
use parking_lot::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServantEvent {
    /// The servant finished its close pass and must leave its registry.
    Unregister(Identity),
}

impl ServantEvent {
    pub fn identity(&self) -> &Identity {
        match self {
            Self::Unregister(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("event bus is shutting down")]
    ShuttingDown,
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ServantEvent);
}

struct Subscription {
    category: String,
    listener: Weak<dyn EventListener>,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    shutting_down: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive events for servants of `category`.
    pub fn subscribe(&self, category: impl Into<String>, listener: Weak<dyn EventListener>) {
        self.subscriptions.write().push(Subscription {
            category: category.into(),
            listener,
        });
    }

    /// Deliver `event` to every live listener of its category. Returns how
    /// many listeners saw it.
    pub fn publish(&self, event: ServantEvent) -> Result<usize, BusError> {
        if self.is_shutting_down() {
            return Err(BusError::ShuttingDown);
        }
        let category = &event.identity().category;

        // Upgrade under the lock, deliver outside it.
        let listeners: Vec<_> = {
            let mut subs = self.subscriptions.write();
            subs.retain(|s| s.listener.strong_count() > 0);
            subs.iter()
                .filter(|s| &s.category == category)
                .filter_map(|s| s.listener.upgrade())
                .collect()
        };
        for listener in &listeners {
            listener.on_event(&event);
        }
        debug!("Servant event for {} reached {} listener(s)", event.identity(), listeners.len());
        Ok(listeners.len())
    }

    pub fn shut_down(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| s.listener.strong_count() > 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Identity>>);

    impl EventListener for Recorder {
        fn on_event(&self, event: &ServantEvent) {
            self.0.lock().push(event.identity().clone());
        }
    }

    #[test]
    fn delivers_only_to_matching_category() {
        let bus = EventBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let weak_a: Weak<dyn EventListener> = Arc::<Recorder>::downgrade(&a);
        let weak_b: Weak<dyn EventListener> = Arc::<Recorder>::downgrade(&b);
        bus.subscribe("a", weak_a);
        bus.subscribe("b", weak_b);

        let reached = bus.publish(ServantEvent::Unregister(Identity::new("a", "x"))).unwrap();
        assert_eq!(reached, 1);
        assert_eq!(a.0.lock().len(), 1);
        assert!(b.0.lock().is_empty());
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let bus = EventBus::new();
        let a = Arc::new(Recorder::default());
        let weak_a: Weak<dyn EventListener> = Arc::<Recorder>::downgrade(&a);
        bus.subscribe("a", weak_a);
        drop(a);

        let reached = bus.publish(ServantEvent::Unregister(Identity::new("a", "x"))).unwrap();
        assert_eq!(reached, 0);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn publish_after_shutdown_fails() {
        let bus = EventBus::new();
        bus.shut_down();
        assert_eq!(
            bus.publish(ServantEvent::Unregister(Identity::new("a", "x"))),
            Err(BusError::ShuttingDown)
        );
    }
}
