//! Instance event types
//!
//! Events are immutable facts about one registered service instance. Every
//! instance owns exactly one stream whose versions start at 1 and grow by one
//! per event. The version doubles as the optimistic-lock token on append.

use std::collections::BTreeMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::utils::{Clock, SystemClock};

/// Kinds of events an instance stream can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The instance registered itself (or was registered by discovery)
    Registered,
    /// The registration descriptor changed
    RegistrationUpdated,
    /// The computed health status changed
    StatusChanged,
    /// Management endpoints were discovered
    EndpointsDetected,
    /// The info endpoint returned new content
    InfoChanged,
    /// The instance went away
    Deregistered,
}

impl EventKind {
    /// Every supported kind, in declaration order
    pub const ALL: [EventKind; 6] = [
        EventKind::Registered,
        EventKind::RegistrationUpdated,
        EventKind::StatusChanged,
        EventKind::EndpointsDetected,
        EventKind::InfoChanged,
        EventKind::Deregistered,
    ];

    /// Stable discriminator stored in the `event_kind` column
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Registered => "REGISTERED",
            EventKind::RegistrationUpdated => "REGISTRATION_UPDATED",
            EventKind::StatusChanged => "STATUS_CHANGED",
            EventKind::EndpointsDetected => "ENDPOINTS_DETECTED",
            EventKind::InfoChanged => "INFO_CHANGED",
            EventKind::Deregistered => "DEREGISTERED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration descriptor announced by an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub health_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    /// Where the registration came from (http-api, discovery, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Registration {
    pub fn new(name: impl Into<String>, health_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health_url: health_url.into(),
            management_url: None,
            service_url: None,
            source: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_management_url(mut self, url: impl Into<String>) -> Self {
        self.management_url = Some(url.into());
        self
    }

    pub fn with_service_url(mut self, url: impl Into<String>) -> Self {
        self.service_url = Some(url.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Health status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Up,
    Down,
    Offline,
    OutOfService,
    Restricted,
    #[default]
    Unknown,
}

/// Status plus the details reported by the health endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusInfo {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl StatusInfo {
    pub fn of(status: Status) -> Self {
        Self {
            status,
            details: Map::new(),
        }
    }

    pub fn of_up() -> Self {
        Self::of(Status::Up)
    }

    pub fn of_down() -> Self {
        Self::of(Status::Down)
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// A detected management endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// Kind-specific event payload
///
/// Serialized with the `type` discriminator next to the payload fields so a
/// stored event can be decoded without knowing its kind up front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    Registered {
        registration: Registration,
    },
    RegistrationUpdated {
        registration: Registration,
    },
    StatusChanged {
        #[serde(rename = "statusInfo")]
        status_info: StatusInfo,
    },
    EndpointsDetected {
        endpoints: Vec<Endpoint>,
    },
    InfoChanged {
        info: Map<String, Value>,
    },
    Deregistered,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Registered { .. } => EventKind::Registered,
            EventPayload::RegistrationUpdated { .. } => EventKind::RegistrationUpdated,
            EventPayload::StatusChanged { .. } => EventKind::StatusChanged,
            EventPayload::EndpointsDetected { .. } => EventKind::EndpointsDetected,
            EventPayload::InfoChanged { .. } => EventKind::InfoChanged,
            EventPayload::Deregistered => EventKind::Deregistered,
        }
    }
}

/// An immutable event in one instance's stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceEvent {
    /// Stream identifier
    pub instance: String,

    /// Position in the stream, starting at 1
    pub version: i64,

    /// Creation time, assigned when the event is constructed. Millisecond
    /// precision, matching the stored `timestamp` column.
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl InstanceEvent {
    /// Create a new event stamped with the current time
    pub fn new(instance: impl Into<String>, version: i64, payload: EventPayload) -> Self {
        Self::stamped(instance, version, &SystemClock, payload)
    }

    /// Create a new event stamped by `clock`
    pub fn stamped(
        instance: impl Into<String>,
        version: i64,
        clock: &dyn Clock,
        payload: EventPayload,
    ) -> Self {
        Self::with_timestamp(instance, version, clock.now(), payload)
    }

    /// Create a new event with a specific timestamp, truncated to milliseconds
    pub fn with_timestamp(
        instance: impl Into<String>,
        version: i64,
        timestamp: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            instance: instance.into(),
            version,
            timestamp: timestamp.trunc_subsecs(3),
            payload,
        }
    }

    pub fn registered(instance: impl Into<String>, version: i64, registration: Registration) -> Self {
        Self::new(instance, version, EventPayload::Registered { registration })
    }

    pub fn status_changed(instance: impl Into<String>, version: i64, status_info: StatusInfo) -> Self {
        Self::new(instance, version, EventPayload::StatusChanged { status_info })
    }

    pub fn deregistered(instance: impl Into<String>, version: i64) -> Self {
        Self::new(instance, version, EventPayload::Deregistered)
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Whether this event carries a registration (used by startup publishing)
    pub fn is_registration(&self) -> bool {
        matches!(self.payload, EventPayload::Registered { .. })
    }

    /// Timestamp as stored in the `timestamp` column
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_kind_serialization() {
        let json = serde_json::to_string(&EventKind::StatusChanged).unwrap();
        assert_eq!(json, "\"STATUS_CHANGED\"");

        for kind in EventKind::ALL {
            let parsed: EventKind =
                serde_json::from_str(&format!("\"{}\"", kind.as_str())).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_event_serialization_embeds_discriminator() {
        let event = InstanceEvent::status_changed("svc-1", 2, StatusInfo::of_up());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "STATUS_CHANGED");
        assert_eq!(value["instance"], "svc-1");
        assert_eq!(value["version"], 2);
        assert_eq!(value["statusInfo"]["status"], "UP");
    }

    #[test]
    fn test_deregistered_has_no_payload_fields() {
        let event = InstanceEvent::deregistered("svc-1", 4);
        let value = serde_json::to_value(&event).unwrap();

        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["type"], "DEREGISTERED");
    }

    #[test]
    fn test_registration_optional_fields_skipped() {
        let reg = Registration::new("billing", "http://billing:8080/actuator/health");
        let value = serde_json::to_value(&reg).unwrap();

        assert_eq!(value["healthUrl"], "http://billing:8080/actuator/health");
        assert!(value.get("managementUrl").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_parse_status_changed_from_json() {
        let raw = json!({
            "instance": "svc-9",
            "version": 7,
            "timestamp": "2024-01-01T00:00:00Z",
            "type": "STATUS_CHANGED",
            "statusInfo": {"status": "OUT_OF_SERVICE", "details": {"disk": "full"}}
        });

        let event: InstanceEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.kind(), EventKind::StatusChanged);
        assert_eq!(event.version, 7);
        match event.payload {
            EventPayload::StatusChanged { status_info } => {
                assert_eq!(status_info.status, Status::OutOfService);
                assert_eq!(status_info.details["disk"], "full");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_stamped_uses_clock_and_truncates_to_millis() {
        use crate::utils::FixedClock;
        use chrono::{Duration, TimeZone};

        let base = Utc.with_ymd_and_hms(2024, 2, 10, 9, 30, 0).unwrap();
        let clock = FixedClock::new(base + Duration::microseconds(1_750));

        let event = InstanceEvent::stamped("svc-1", 1, &clock, EventPayload::Deregistered);
        assert_eq!(event.timestamp, base + Duration::milliseconds(1));
        assert_eq!(event.timestamp_millis(), base.timestamp_millis() + 1);
    }

    #[test]
    fn test_is_registration() {
        let reg = InstanceEvent::registered("a", 1, Registration::new("a", "http://a/health"));
        let status = InstanceEvent::status_changed("a", 2, StatusInfo::of_down());

        assert!(reg.is_registration());
        assert!(!status.is_registration());
    }
}
