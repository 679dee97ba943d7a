//! Instance Journal
//!
//! An event-sourced journal of service instance lifecycle events. Every
//! registered instance owns one version-ordered stream of events
//! (REGISTERED, STATUS_CHANGED, ...). Reads are served from memory, writes
//! are checked with optimistic locking and persisted to SQLite in the
//! background.
//!
//! # Features
//!
//! - **Optimistic Appends**: per-instance version check, no global write lock
//! - **Replica Tolerant**: conflicts are resolved by reloading from storage and
//!   retrying once; duplicate rows from peers are ignored
//! - **Tolerant Decoding**: a corrupt stored row never blocks loading the rest
//! - **Retention**: age and per-instance count caps on the durable log
//!
//! # Modules
//!
//! - `types`: Event model (InstanceEvent, EventPayload, Registration, StatusInfo)
//! - `event_store`: In-memory store, persist worker, subscribers, retention
//! - `persistence`: Repository contract, SQLite implementation, serializer
//! - `config`: Journal properties and storage configuration
//! - `error`: Error types
//! - `utils`: Clock abstraction and timestamp helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use instance_journal::{
//!     InstanceEventStore, InstanceEvent, JournalProperties, Registration,
//!     SqliteEventRepository, StorageConfig,
//! };
//!
//! fn main() -> instance_journal::JournalResult<()> {
//!     let repository = Arc::new(SqliteEventRepository::open(&StorageConfig::new("data/journal.db"))?);
//!     let store = InstanceEventStore::new(repository, JournalProperties::default())?;
//!
//!     let registration = Registration::new("billing", "http://billing:8080/actuator/health");
//!     store.append(vec![InstanceEvent::registered("billing-1", 1, registration)]);
//!
//!     assert_eq!(store.find("billing-1").len(), 1);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod event_store;
pub mod persistence;
pub mod types;
pub mod utils;

// Re-export commonly used items at crate root
pub use config::{JournalConfig, JournalProperties, StartupPublish, StorageConfig};
pub use error::{JournalError, JournalResult};
pub use event_store::{
    AppendOutcome, EventBroadcaster, EventSubscriber, FnSubscriber, InstanceEventStore,
    RetentionReport, RetentionService,
};
pub use persistence::{EventRepository, EventSerializer, SqliteEventRepository};
pub use types::{
    Endpoint, EventKind, EventPayload, InstanceEvent, Registration, Status, StatusInfo,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
