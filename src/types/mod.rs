//! Data types for the instance journal
//!
//! This module contains the event model shared by the store, the
//! persistence layer and subscribers.

mod event;

pub use event::{
    Endpoint, EventKind, EventPayload, InstanceEvent, Registration, Status, StatusInfo,
};
