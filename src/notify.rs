//! Explicit publish/subscribe registry
//!
//! Subscribers receive events on their own bounded flume channel and stay
//! registered until they call [`Subscribers::unsubscribe`] or drop their
//! receiver. A full channel drops the event for that subscriber only so a
//! slow observer never stalls the publishing loop.

use std::sync::{Arc, Mutex, MutexGuard};

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscription<E> {
    pub id: SubscriptionId,
    pub events: Receiver<E>,
}

struct Registry<E> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Sender<E>)>,
}

pub struct Subscribers<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new observer with room for `capacity` pending events.
    pub fn subscribe(&self, capacity: usize) -> Subscription<E> {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let mut registry = self.lock();
        let id = SubscriptionId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, tx));
        Subscription { id, events: rx }
    }

    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.entries.len();
        registry.entries.retain(|(sid, _)| *sid != id);
        registry.entries.len() != before
    }

    pub fn publish(&self, event: E) {
        let mut registry = self.lock();
        registry.entries.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Subscriber {:?} is full, event dropped", id);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Subscriber {:?} dropped its receiver", id);
                false
            }
        });
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber() {
        let subs = Subscribers::new();
        let a = subs.subscribe(4);
        let b = subs.subscribe(4);
        subs.publish(7u32);
        assert_eq!(a.events.try_recv(), Ok(7));
        assert_eq!(b.events.try_recv(), Ok(7));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let subs = Subscribers::new();
        let a = subs.subscribe(4);
        assert!(subs.unsubscribe(a.id));
        assert!(!subs.unsubscribe(a.id));
        subs.publish(1u32);
        assert!(a.events.try_recv().is_err());
        assert!(subs.is_empty());
    }

    #[test]
    fn full_subscriber_keeps_oldest_and_stays_registered() {
        let subs = Subscribers::new();
        let a = subs.subscribe(1);
        subs.publish(1u32);
        subs.publish(2u32);
        assert_eq!(a.events.try_recv(), Ok(1));
        assert_eq!(subs.len(), 1);
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let subs = Subscribers::<u32>::new();
        drop(subs.subscribe(1));
        subs.publish(1);
        assert!(subs.is_empty());
    }
}
