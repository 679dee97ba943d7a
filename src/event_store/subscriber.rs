//! Subscriber fan-out for appended events
//!
//! Subscribers are notified synchronously after every successful append and
//! once at startup by `publish_stored_events`. Delivery is at-least-once, so
//! subscribers must tolerate seeing the same `(instance, version)` twice.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use crate::types::InstanceEvent;

/// Receiver of newly appended (or replayed) events
///
/// Appends notify while holding the affected instance's lock, so batches of
/// one instance arrive in version order. An implementation must not append
/// to the instance it is being notified about.
pub trait EventSubscriber: Send + Sync {
    fn on_events(&self, events: &[InstanceEvent]);
}

/// Adapter turning a closure into a subscriber
pub struct FnSubscriber<F>(F);

impl<F> FnSubscriber<F>
where
    F: Fn(&[InstanceEvent]) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventSubscriber for FnSubscriber<F>
where
    F: Fn(&[InstanceEvent]) + Send + Sync,
{
    fn on_events(&self, events: &[InstanceEvent]) {
        (self.0)(events)
    }
}

/// A batch of events as delivered to broadcast receivers
#[derive(Clone, Debug)]
pub struct JournalMessage {
    pub events: Vec<InstanceEvent>,

    /// Monotonically increasing sequence ID for gap detection
    pub sequence_id: u64,
}

/// In-process fan-out over a tokio broadcast channel
pub struct EventBroadcaster {
    tx: broadcast::Sender<JournalMessage>,
    sequence_counter: AtomicU64,
}

impl EventBroadcaster {
    /// Create a new broadcaster with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            sequence_counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to receive broadcast batches
    pub fn subscribe(&self) -> broadcast::Receiver<JournalMessage> {
        self.tx.subscribe()
    }

    /// Get the current sequence ID
    pub fn current_sequence_id(&self) -> u64 {
        self.sequence_counter.load(Ordering::SeqCst)
    }
}

impl EventSubscriber for EventBroadcaster {
    fn on_events(&self, events: &[InstanceEvent]) {
        let seq = self.sequence_counter.fetch_add(1, Ordering::SeqCst);
        let msg = JournalMessage {
            events: events.to_vec(),
            sequence_id: seq,
        };
        // Ignore errors - just means no receivers are connected
        let _ = self.tx.send(msg);
    }
}
