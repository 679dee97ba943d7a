//! Event Store Module for the instance journal
//!
//! This module provides the event sourcing core:
//! - `InstanceEventStore`: in-memory streams, optimistic append, conflict recovery
//! - `PersistWorker`: background durable writes
//! - `EventSubscriber`: fan-out of appended events
//! - `RetentionService`: age and count based cleanup of stored events
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//! ┌─────────┐    ┌──────────────┐    ┌───────────────┐    ┌─────────────┐
//! │ append  │───►│ version check│───►│ PersistWorker │───►│ subscribers │
//! │         │    │ + cache push │    │ (save_batch)  │    │ on_events() │
//! └─────────┘    └──────┬───────┘    └───────────────┘    └─────────────┘
//!                       │ conflict
//!                       ▼
//!               ┌────────────────┐    ┌──────────────┐
//!               │ reload instance│───►│ retry once,  │
//!               │ from database  │    │ else drop    │
//!               └────────────────┘    └──────────────┘
//!
//! Read Path:
//! ┌──────────────┐
//! │ find/find_all│───► in-memory streams only
//! └──────────────┘
//! ```

mod retention;
mod store;
mod subscriber;
mod writer;

pub use retention::{RetentionReport, RetentionService};
pub use store::{AppendOutcome, InstanceEventStore, VersionConflict};
pub use subscriber::{EventBroadcaster, EventSubscriber, FnSubscriber, JournalMessage};
pub use writer::PersistWorker;
