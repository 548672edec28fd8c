//! # Subscriber Registry
//!
//! The single piece of state mutated from many places at once: connection
//! handlers add and remove their own entry, and the dispatcher removes
//! entries whose connection has gone away. All mutations are serialized by
//! one mutex. Iteration never happens under that mutex; `snapshot` copies the
//! current members out and the caller walks the copy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Unique identity of one subscriber connection.
pub type SubscriberId = u64;

/// Why a frame could not be queued for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The connection's writer has gone away.
    #[error("subscriber connection is closed")]
    Closed,
    /// The subscriber's queue is at capacity.
    #[error("subscriber queue is full")]
    Full,
}

/// # Subscriber
///
/// Handle to one outbound connection. The sending half of a bounded queue
/// lives here; the receiving half is drained by the connection's own task,
/// which performs the actual socket write.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<Arc<str>>,
    dropped: AtomicU64,
}

impl Subscriber {
    /// Creates a subscriber with a queue of `queue_depth` frames and returns
    /// the receiving half for the connection task.
    pub fn new(id: SubscriberId, queue_depth: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        (
            Self {
                id,
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// The subscriber's identity.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// False once the connection task has dropped its receiver.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Number of frames skipped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues `frame` without waiting.
    pub fn try_send(&self, frame: Arc<str>) -> Result<(), SendError> {
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }
}

/// # Subscriber Registry
///
/// Set of live subscribers keyed by identity. `add` and `remove` are
/// idempotent.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    members: Mutex<HashMap<SubscriberId, Arc<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<SubscriberId, Arc<Subscriber>>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid data.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a fresh identity, builds the subscriber and adds it.
    pub fn register(&self, queue_depth: usize) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (subscriber, receiver) = Subscriber::new(id, queue_depth);
        self.add(Arc::new(subscriber));
        (id, receiver)
    }

    /// Inserts `subscriber`. Returns false, leaving the registry unchanged,
    /// if its identity is already present.
    pub fn add(&self, subscriber: Arc<Subscriber>) -> bool {
        let mut members = self.members();
        if members.contains_key(&subscriber.id) {
            return false;
        }
        debug!(subscriber_id = subscriber.id, "subscriber added to registry");
        members.insert(subscriber.id, subscriber);
        true
    }

    /// Removes `id` if present. Removing an absent identity is a no-op.
    pub fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.members().remove(&id).is_some();
        if removed {
            debug!(subscriber_id = id, "subscriber removed from registry");
        }
        removed
    }

    /// Copies out the current members. Later `add`/`remove` calls do not
    /// affect the returned vector.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.members().values().cloned().collect()
    }

    /// Whether `id` is currently registered.
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members().contains_key(&id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.members().len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_unique_ids() {
        let registry = SubscriberRegistry::new();
        let (a, _rx_a) = registry.register(4);
        let (b, _rx_b) = registry.register(4);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (sub, _rx) = Subscriber::new(7, 1);
        let sub = Arc::new(sub);
        assert!(registry.add(Arc::clone(&sub)));
        assert!(!registry.add(sub));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_twice_matches_remove_once() {
        let registry = SubscriberRegistry::new();
        let (keep, _rx_keep) = registry.register(1);
        let (gone, _rx_gone) = registry.register(1);

        assert!(registry.remove(gone));
        let after_once: Vec<_> = registry.snapshot().iter().map(|s| s.id()).collect();
        assert!(!registry.remove(gone));
        let after_twice: Vec<_> = registry.snapshot().iter().map(|s| s.id()).collect();

        assert_eq!(after_once, after_twice);
        assert_eq!(after_twice, vec![keep]);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_mutation() {
        let registry = SubscriberRegistry::new();
        let (first, _rx1) = registry.register(1);
        let snapshot = registry.snapshot();

        let (_second, _rx2) = registry.register(1);
        registry.remove(first);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), first);
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(first));
    }

    #[test]
    fn test_try_send_reports_full_and_closed() {
        let (sub, rx) = Subscriber::new(1, 1);
        assert_eq!(sub.try_send(Arc::from("a")), Ok(()));
        assert_eq!(sub.try_send(Arc::from("b")), Err(SendError::Full));
        assert_eq!(sub.dropped(), 1);

        drop(rx);
        assert!(!sub.is_alive());
        assert_eq!(sub.try_send(Arc::from("c")), Err(SendError::Closed));
    }
}
