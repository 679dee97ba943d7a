//! Storage contract for the event journal

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::JournalResult;
use crate::types::InstanceEvent;

/// Durable event storage
///
/// Implementations hold no cache of their own. Load operations never fail:
/// unreadable rows are skipped and an unreachable store reads as empty.
pub trait EventRepository: Send + Sync {
    /// Insert one event. A duplicate `(instance, version)` is reported as an
    /// error; see [`crate::JournalError::is_duplicate_key`].
    fn save(&self, event: &InstanceEvent) -> JournalResult<()>;

    /// Insert many events, ignoring members that already exist.
    ///
    /// Returns the number of rows actually inserted.
    fn save_batch(&self, events: &[InstanceEvent]) -> JournalResult<usize>;

    /// All events, ordered by instance then version
    fn load_all(&self) -> Vec<InstanceEvent>;

    /// One instance's events, ordered by version
    fn load_by_instance_id(&self, instance: &str) -> Vec<InstanceEvent>;

    /// Delete events whose timestamp is strictly before `cutoff`
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> JournalResult<usize>;

    /// Delete all but the `keep` newest events of one instance
    fn delete_excess_events_for_instance(&self, instance: &str, keep: usize) -> JournalResult<usize>;

    /// Instances that currently have at least one stored event
    fn distinct_instance_ids(&self) -> JournalResult<BTreeSet<String>>;
}
