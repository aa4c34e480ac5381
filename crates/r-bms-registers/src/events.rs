//! ---
//! bms_section: "02-messaging-ipc-data-model"
//! bms_subsection: "module"
//! bms_type: "source"
//! bms_scope: "code"
//! bms_description: "Update events and the synchronous subscriber registry."
//! bms_version: "v0.0.0-prealpha"
//! bms_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::snapshot::{Category, RegisterSnapshot};

/// Event published after a producer refreshed its cache.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    /// Wall-clock time of the refresh.
    pub timestamp: DateTime<Utc>,
    /// Which producer and schedule the values came from.
    pub category: Category,
    /// Values at publish time.
    pub snapshot: Arc<RegisterSnapshot>,
}

impl UpdateEvent {
    /// Bundle a snapshot into an event.
    pub fn new(timestamp: DateTime<Utc>, category: Category, snapshot: RegisterSnapshot) -> Self {
        Self {
            timestamp,
            category,
            snapshot: Arc::new(snapshot),
        }
    }
}

/// Consumer of update events.
///
/// Called on the producer's thread, so implementations must return quickly
/// and never block on I/O.
pub trait Subscriber: Send + Sync {
    /// Handle one event.
    fn on_update(&self, event: &UpdateEvent);

    /// Name used in logs.
    fn name(&self) -> &str {
        "subscriber"
    }
}

impl<F> Subscriber for F
where
    F: Fn(&UpdateEvent) + Send + Sync,
{
    fn on_update(&self, event: &UpdateEvent) {
        self(event)
    }
}

/// Fan-out list owned by a producer. Subscriptions happen before the
/// producer thread starts.
#[derive(Clone, Default)]
pub struct Publisher {
    subscribers: Vec<Arc<dyn Subscriber>>,
}

impl Publisher {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer.
    pub fn subscribe(&mut self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Deliver `event` to every subscriber in registration order.
    pub fn publish(&self, event: &UpdateEvent) {
        for subscriber in &self.subscribers {
            subscriber.on_update(event);
        }
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether nobody is listening.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.subscribers.iter().map(|s| s.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn every_subscriber_sees_each_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut publisher = Publisher::new();
        for tag in ["a", "b"] {
            let sink = Arc::clone(&seen);
            publisher.subscribe(Arc::new(move |event: &UpdateEvent| {
                sink.lock().push((tag, event.category));
            }));
        }
        assert_eq!(publisher.len(), 2);

        let snapshot: RegisterSnapshot = [(9u8, vec![1, 2, 3, 4])].into_iter().collect();
        publisher.publish(&UpdateEvent::new(Utc::now(), Category::BmsFast, snapshot));

        assert_eq!(
            *seen.lock(),
            vec![("a", Category::BmsFast), ("b", Category::BmsFast)]
        );
    }
}
