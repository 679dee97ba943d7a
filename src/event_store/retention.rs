//! Retention of the durable event log
//!
//! Removes rows older than the retention window, then caps every instance at
//! `max_events_per_instance` rows, keeping the newest. Both steps are
//! idempotent. The in-memory cache is only affected through
//! [`RetentionService::cleanup_and_reload`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::store::InstanceEventStore;
use crate::config::JournalProperties;
use crate::error::JournalResult;
use crate::persistence::EventRepository;
use crate::utils::{Clock, SystemClock};

/// Rows removed by one cleanup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub deleted_by_age: usize,
    pub deleted_by_count: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.deleted_by_age + self.deleted_by_count
    }
}

/// Scheduled garbage collection of stored events
pub struct RetentionService {
    repository: Arc<dyn EventRepository>,
    properties: JournalProperties,
    clock: Arc<dyn Clock>,
}

impl RetentionService {
    pub fn new(repository: Arc<dyn EventRepository>, properties: JournalProperties) -> Self {
        Self::with_clock(repository, properties, Arc::new(SystemClock))
    }

    pub fn with_clock(
        repository: Arc<dyn EventRepository>,
        properties: JournalProperties,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repository,
            properties,
            clock,
        }
    }

    /// Run one cleanup pass against storage
    pub fn cleanup(&self) -> JournalResult<RetentionReport> {
        info!("Starting event retention cleanup");

        let cutoff = retention_cutoff(self.clock.now(), self.properties.retention_period());
        let deleted_by_age = self.repository.delete_older_than(cutoff)?;
        info!(
            deleted = deleted_by_age,
            retention_days = self.properties.retention_days(),
            "Deleted events older than retention period"
        );

        let max_events = self.properties.max_events_per_instance();
        let mut deleted_by_count = 0;
        for instance in self.repository.distinct_instance_ids()? {
            match self
                .repository
                .delete_excess_events_for_instance(&instance, max_events)
            {
                Ok(deleted) => deleted_by_count += deleted,
                Err(e) => {
                    warn!(instance = %instance, error = %e, "Failed to delete excess events for instance");
                }
            }
        }

        if deleted_by_count > 0 {
            info!(
                deleted = deleted_by_count,
                max_per_instance = max_events,
                "Deleted excess events"
            );
        }

        info!("Event retention cleanup completed");
        Ok(RetentionReport {
            deleted_by_age,
            deleted_by_count,
        })
    }

    /// Clean up storage, then rebuild the store's cache if anything was deleted
    ///
    /// Blocks the calling thread; from async code go through `spawn_blocking`.
    pub fn cleanup_and_reload(&self, store: &InstanceEventStore) -> JournalResult<RetentionReport> {
        let report = self.cleanup()?;
        if report.total() > 0 {
            store.reload_from_storage()?;
        }
        Ok(report)
    }
}

/// Start of the retention window; windows reaching past the earliest
/// representable instant start there instead
fn retention_cutoff(now: DateTime<Utc>, period: chrono::Duration) -> DateTime<Utc> {
    now.checked_sub_signed(period).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteEventRepository;
    use crate::types::{EventPayload, InstanceEvent, StatusInfo};
    use crate::utils::FixedClock;
    use chrono::{Duration, TimeZone};

    fn status_at(instance: &str, version: i64, timestamp: DateTime<Utc>) -> InstanceEvent {
        InstanceEvent::with_timestamp(
            instance,
            version,
            timestamp,
            EventPayload::StatusChanged {
                status_info: StatusInfo::of_up(),
            },
        )
    }

    #[test]
    fn test_cleanup_applies_age_then_count() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let repo = Arc::new(SqliteEventRepository::open_in_memory().unwrap());

        // svc-old: entirely outside a 10-day window
        repo.save_batch(&[
            status_at("svc-old", 1, now - Duration::days(20)),
            status_at("svc-old", 2, now - Duration::days(15)),
        ])
        .unwrap();
        // svc-busy: recent but over the 3-event cap
        let busy: Vec<InstanceEvent> = (1..=5)
            .map(|v| status_at("svc-busy", v, now - Duration::hours(10 - v)))
            .collect();
        repo.save_batch(&busy).unwrap();

        let service = RetentionService::with_clock(
            repo.clone(),
            JournalProperties::new(10, 3, false),
            Arc::new(FixedClock::new(now)),
        );

        let report = service.cleanup().unwrap();
        assert_eq!(report.deleted_by_age, 2);
        assert_eq!(report.deleted_by_count, 2);
        assert_eq!(repo.count_events(Some("svc-old")).unwrap(), 0);

        let kept: Vec<i64> = repo
            .load_by_instance_id("svc-busy")
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);

        assert_eq!(service.cleanup().unwrap(), RetentionReport::default());
    }

    #[test]
    fn test_retention_cutoff_clamps_on_overflow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let huge = JournalProperties::new(i64::from(u32::MAX), 10, false);

        assert_eq!(retention_cutoff(now, huge.retention_period()), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            retention_cutoff(now, Duration::days(1)),
            Utc.with_ymd_and_hms(2024, 2, 29, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_cleanup_with_very_long_retention_keeps_everything() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let repo = Arc::new(SqliteEventRepository::open_in_memory().unwrap());
        repo.save_batch(&[
            status_at("svc-1", 1, now - Duration::days(3650)),
            status_at("svc-1", 2, now),
        ])
        .unwrap();

        let service = RetentionService::with_clock(
            repo.clone(),
            JournalProperties::new(1_000_000_000, 10, false),
            Arc::new(FixedClock::new(now)),
        );

        assert_eq!(service.cleanup().unwrap(), RetentionReport::default());
        assert_eq!(repo.count_events(Some("svc-1")).unwrap(), 2);
    }
}
