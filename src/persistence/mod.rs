//! Durable storage for instance events
//!
//! - `EventRepository`: the storage contract the store and retention job use
//! - `SqliteEventRepository`: SQLite implementation of that contract
//! - `EventSerializer`: JSON encoding of events into the `payload` column
//!
//! # Schema
//!
//! ```text
//! event(id, instance_id, event_kind, version, timestamp, payload)
//!        UNIQUE (instance_id, version)
//! ```
//!
//! The uniqueness constraint is what lets redundant replicas write the same
//! event concurrently: the second insert fails as a duplicate and is ignored.

mod repository;
mod serializer;
mod sqlite;

pub use repository::EventRepository;
pub use serializer::EventSerializer;
pub use sqlite::SqliteEventRepository;
