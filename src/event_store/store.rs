//! Instance Event Store - in-memory event log backed by durable storage
//!
//! The store keeps every instance's stream in memory and serves all reads
//! from there. Appends are checked against the stream head (optimistic
//! locking), become visible immediately, are written to the repository in the
//! background and are then handed to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::subscriber::EventSubscriber;
use super::writer::PersistWorker;
use crate::config::{JournalProperties, StartupPublish};
use crate::error::JournalResult;
use crate::persistence::EventRepository;
use crate::types::InstanceEvent;

/// One instance's cached events, version-ascending
type Stream = Arc<RwLock<Vec<InstanceEvent>>>;

/// An append that did not line up with the stream head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    pub instance: String,
    /// Version the stream would have accepted next
    pub expected: i64,
    /// Version that was offered instead
    pub actual: i64,
}

impl std::fmt::Display for VersionConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "instance {} expected version {} but got {}",
            self.instance, self.expected, self.actual
        )
    }
}

/// What happened to the events passed to [`InstanceEventStore::append`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Events accepted on the first attempt
    pub appended: usize,
    /// Events accepted after a conflict and a reload from storage
    pub recovered: usize,
    /// Events dropped as already applied by a peer
    pub dropped: usize,
}

impl AppendOutcome {
    /// True when nothing was dropped
    pub fn is_complete(&self) -> bool {
        self.dropped == 0
    }
}

/// Event store with an authoritative in-memory cache
pub struct InstanceEventStore {
    streams: RwLock<HashMap<String, Stream>>,
    /// Appends hold this shared; a cache reload holds it exclusively
    reload_gate: RwLock<()>,
    repository: Arc<dyn EventRepository>,
    writer: PersistWorker,
    subscribers: RwLock<Vec<Arc<dyn EventSubscriber>>>,
    properties: JournalProperties,
}

impl InstanceEventStore {
    /// Create a store and hydrate it from the repository
    pub fn new(
        repository: Arc<dyn EventRepository>,
        properties: JournalProperties,
    ) -> JournalResult<Self> {
        let writer = PersistWorker::spawn(repository.clone())?;
        let store = Self {
            streams: RwLock::new(HashMap::new()),
            reload_gate: RwLock::new(()),
            repository,
            writer,
            subscribers: RwLock::new(Vec::new()),
            properties,
        };
        store.load_from_storage();
        Ok(store)
    }

    /// Get the properties this store was built with
    pub fn properties(&self) -> &JournalProperties {
        &self.properties
    }

    /// Attach a subscriber for future appends and startup publishing
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Append events for one or more instances
    ///
    /// Events for the same instance must be in version order and start at the
    /// stream's next version. Each instance is checked, applied, queued for
    /// storage and delivered to subscribers under its own lock, so writes and
    /// notifications of one stream keep version order. Instances that
    /// conflict are reloaded from storage and retried once; events that still
    /// conflict are dropped as already applied.
    pub fn append(&self, events: Vec<InstanceEvent>) -> AppendOutcome {
        let mut outcome = AppendOutcome::default();
        if events.is_empty() {
            return outcome;
        }

        // Recursive so a subscriber may append to another instance.
        let _gate = self.reload_gate.read_recursive();
        let mut conflicts = Vec::new();

        for (instance, batch) in group_by_instance(events) {
            match self.try_append(&instance, &batch) {
                Ok(()) => outcome.appended += batch.len(),
                Err(conflict) => conflicts.push((conflict, batch)),
            }
        }

        for (conflict, batch) in conflicts {
            let count = batch.len();
            if self.recover(conflict, batch) {
                outcome.recovered += count;
            } else {
                outcome.dropped += count;
            }
        }

        outcome
    }

    /// Events of one instance, version-ascending; empty for unknown ids
    pub fn find(&self, instance: &str) -> Vec<InstanceEvent> {
        match self.stream(instance) {
            Some(stream) => stream.read().clone(),
            None => Vec::new(),
        }
    }

    /// Events of every instance, grouped by instance id
    pub fn find_all(&self) -> Vec<InstanceEvent> {
        self.sorted_streams()
            .iter()
            .flat_map(|(_, stream)| stream.read().clone())
            .collect()
    }

    /// Instance ids with at least one cached event
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .streams
            .read()
            .iter()
            .filter(|(_, stream)| !stream.read().is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Instances whose cached stream holds no REGISTERED event
    ///
    /// Such streams never trigger status checks at startup.
    pub fn orphaned_instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .streams
            .read()
            .iter()
            .filter(|(_, stream)| {
                let events = stream.read();
                !events.is_empty() && !events.iter().any(InstanceEvent::is_registration)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Re-emit cached events to subscribers; returns how many were published
    ///
    /// Call once at startup after every subscriber is attached. What gets
    /// published is chosen by [`JournalProperties::startup_publish`].
    pub fn publish_stored_events(&self) -> usize {
        let events: Vec<InstanceEvent> = match self.properties.startup_publish() {
            StartupPublish::AllEvents => self.find_all(),
            StartupPublish::LatestRegistration => {
                self.sorted_streams()
                    .iter()
                    .filter_map(|(_, stream)| {
                        stream
                            .read()
                            .iter()
                            .rev()
                            .find(|e| e.is_registration())
                            .cloned()
                    })
                    .collect()
            }
        };

        if events.is_empty() {
            info!("No stored events to publish");
            return 0;
        }

        info!(count = events.len(), mode = ?self.properties.startup_publish(), "Publishing stored events");
        self.notify(&events);
        events.len()
    }

    /// Empty the in-memory cache; storage is untouched
    pub fn clear_all(&self) {
        self.streams.write().clear();
        info!("Cleared all events from in-memory cache");
    }

    /// Wait until every append accepted so far has been written to storage
    ///
    /// Blocks the calling thread; from async code go through `spawn_blocking`.
    pub fn flush(&self) -> JournalResult<()> {
        self.writer.flush()
    }

    /// Rebuild the whole cache from storage
    ///
    /// Used after retention cleanup so deleted rows disappear from memory.
    /// Appends wait until the new cache is in place, and pending writes are
    /// drained before loading, so no accepted event is lost by the swap.
    ///
    /// Blocks the calling thread; from async code go through `spawn_blocking`.
    pub fn reload_from_storage(&self) -> JournalResult<usize> {
        let _gate = self.reload_gate.write();
        self.writer.flush()?;
        Ok(self.load_from_storage())
    }

    /// Replace the cache with what the repository holds
    fn load_from_storage(&self) -> usize {
        info!("Loading events from database...");
        let events = self.repository.load_all();

        let mut grouped: HashMap<String, Vec<InstanceEvent>> = HashMap::new();
        for event in events {
            grouped.entry(event.instance.clone()).or_default().push(event);
        }

        let cap = self.properties.max_events_per_instance();
        let mut loaded = 0;
        let mut rebuilt = HashMap::with_capacity(grouped.len());
        for (instance, mut stream) in grouped {
            stream.sort_by_key(|e| e.version);
            stream.dedup_by_key(|e| e.version);
            if has_gap(&stream) {
                // Usually an undecodable row; the readable events are kept.
                warn!(instance = %instance, "Stored stream has a version gap");
            }
            trim_to_cap(&mut stream, cap);
            loaded += stream.len();
            rebuilt.insert(instance, Arc::new(RwLock::new(stream)));
        }

        let instance_count = rebuilt.len();
        *self.streams.write() = rebuilt;

        if loaded == 0 {
            info!("No events found in database");
            return 0;
        }
        info!(events = loaded, instances = instance_count, "Loaded events from database");

        let orphaned = self.orphaned_instance_ids();
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "Found instances with orphaned events - these will not receive status checks");
        }

        loaded
    }

    /// Handles to every stream, ordered by instance id
    fn sorted_streams(&self) -> Vec<(String, Stream)> {
        let mut streams: Vec<(String, Stream)> = self
            .streams
            .read()
            .iter()
            .map(|(id, stream)| (id.clone(), stream.clone()))
            .collect();
        streams.sort_by(|a, b| a.0.cmp(&b.0));
        streams
    }

    fn stream(&self, instance: &str) -> Option<Stream> {
        self.streams.read().get(instance).cloned()
    }

    fn stream_or_insert(&self, instance: &str) -> Stream {
        if let Some(stream) = self.stream(instance) {
            return stream;
        }
        self.streams
            .write()
            .entry(instance.to_string())
            .or_default()
            .clone()
    }

    /// Check and apply one instance's batch under that instance's lock
    fn try_append(&self, instance: &str, batch: &[InstanceEvent]) -> Result<(), VersionConflict> {
        let first = batch.first().map(|e| e.version).unwrap_or(1);
        let stream = match self.stream(instance) {
            Some(stream) => stream,
            // Only a version-1 event may create a stream.
            None if first == 1 => self.stream_or_insert(instance),
            None => {
                return Err(VersionConflict {
                    instance: instance.to_string(),
                    expected: 1,
                    actual: first,
                })
            }
        };

        let mut log = stream.write();
        apply(instance, &mut log, batch, self.properties.max_events_per_instance())?;
        self.commit(batch);
        Ok(())
    }

    /// Reload the conflicting instance from storage and retry once
    fn recover(&self, conflict: VersionConflict, batch: Vec<InstanceEvent>) -> bool {
        let instance = conflict.instance.clone();
        info!(instance = %instance, conflict = %conflict, "Version conflict, refreshing from database");

        let stored = self.repository.load_by_instance_id(&instance);
        let first = batch.first().map(|e| e.version).unwrap_or(1);

        let stream = match self.stream(&instance) {
            Some(stream) => stream,
            None if !stored.is_empty() || first == 1 => self.stream_or_insert(&instance),
            None => {
                info!(instance = %instance, "Dropping events for unknown instance (version conflict on retry)");
                return false;
            }
        };

        let cap = self.properties.max_events_per_instance();
        let mut log = stream.write();
        if !stored.is_empty() {
            let stored_count = stored.len();
            let mut merged = merge_streams(&log, stored);
            trim_to_cap(&mut merged, cap);
            *log = merged;
            info!(instance = %instance, stored = stored_count, cached = log.len(), "Refreshed cache from database");
        }

        match apply(&instance, &mut log, &batch, cap) {
            Ok(()) => {
                info!(instance = %instance, count = batch.len(), "Appended events after cache refresh");
                self.commit(&batch);
                true
            }
            Err(retry_conflict) => {
                // Expected during rolling restarts: a peer recorded it first.
                info!(instance = %instance, conflict = %retry_conflict, "Event already processed (version conflict on retry)");
                false
            }
        }
    }

    /// Hand accepted events to the writer, then to subscribers
    ///
    /// Called with the stream's write lock held.
    fn commit(&self, events: &[InstanceEvent]) {
        self.writer.enqueue(events.to_vec());
        self.notify(events);
    }

    fn notify(&self, events: &[InstanceEvent]) {
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.on_events(events);
        }
    }
}

/// Split a mixed batch into per-instance batches, keeping first-seen order
fn group_by_instance(events: Vec<InstanceEvent>) -> Vec<(String, Vec<InstanceEvent>)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<InstanceEvent>)> = Vec::new();

    for event in events {
        match index.get(&event.instance) {
            Some(&i) => groups[i].1.push(event),
            None => {
                index.insert(event.instance.clone(), groups.len());
                groups.push((event.instance.clone(), vec![event]));
            }
        }
    }

    groups
}

/// Verify a batch continues the stream head exactly, then append it
fn apply(
    instance: &str,
    log: &mut Vec<InstanceEvent>,
    batch: &[InstanceEvent],
    cap: usize,
) -> Result<(), VersionConflict> {
    let head = log.last().map(|e| e.version).unwrap_or(0);

    for (offset, event) in batch.iter().enumerate() {
        let expected = head + 1 + offset as i64;
        if event.version != expected {
            return Err(VersionConflict {
                instance: instance.to_string(),
                expected,
                actual: event.version,
            });
        }
    }

    log.extend(batch.iter().cloned());
    trim_to_cap(log, cap);
    debug!(instance, head = head + batch.len() as i64, "Appended events");
    Ok(())
}

/// Union of cached and stored events; stored wins on equal versions
///
/// The result is never shorter than the cached stream, so a reader can not
/// observe a stream shrinking and growing back during recovery.
fn merge_streams(cached: &[InstanceEvent], stored: Vec<InstanceEvent>) -> Vec<InstanceEvent> {
    let mut by_version: BTreeMap<i64, InstanceEvent> = cached
        .iter()
        .map(|e| (e.version, e.clone()))
        .collect();
    for event in stored {
        by_version.insert(event.version, event);
    }
    by_version.into_values().collect()
}

fn has_gap(sorted: &[InstanceEvent]) -> bool {
    sorted.windows(2).any(|w| w[0].version + 1 != w[1].version)
}

/// Drop the oldest cached entries beyond `cap`; the head always survives
fn trim_to_cap(log: &mut Vec<InstanceEvent>, cap: usize) {
    let cap = cap.max(1);
    if log.len() > cap {
        let excess = log.len() - cap;
        log.drain(..excess);
    }
}
