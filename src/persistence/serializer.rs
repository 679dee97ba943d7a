//! JSON encoding of instance events
//!
//! The stored payload is the whole event as one JSON object. The `type`
//! field selects the variant on decode, so rows can be read back without
//! consulting the `event_kind` column.

use tracing::warn;

use crate::error::{JournalError, JournalResult};
use crate::types::InstanceEvent;

/// Stateless encoder/decoder for stored events
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSerializer;

impl EventSerializer {
    pub fn new() -> Self {
        Self
    }

    /// Encode an event; failure here is a schema bug, not a runtime condition.
    pub fn serialize(&self, event: &InstanceEvent) -> JournalResult<String> {
        serde_json::to_string(event).map_err(|source| JournalError::Serialization {
            instance: event.instance.clone(),
            version: event.version,
            source,
        })
    }

    /// Decode a stored payload. Corrupt or unknown payloads yield `None`.
    pub fn deserialize(&self, json: &str) -> Option<InstanceEvent> {
        match serde_json::from_str(json) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Failed to deserialize stored event");
                None
            }
        }
    }
}
