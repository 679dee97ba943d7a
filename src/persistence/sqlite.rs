//! SQLite-backed event repository

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Params};
use tracing::{debug, error, info, warn};

use super::repository::EventRepository;
use super::serializer::EventSerializer;
use crate::config::StorageConfig;
use crate::error::{JournalError, JournalResult};
use crate::types::InstanceEvent;

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS event (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        instance_id TEXT    NOT NULL,
        event_kind  TEXT    NOT NULL,
        version     INTEGER NOT NULL,
        timestamp   INTEGER NOT NULL,
        payload     TEXT    NOT NULL,
        UNIQUE (instance_id, version)
    );
    CREATE INDEX IF NOT EXISTS idx_event_timestamp ON event (timestamp);
";

const INSERT_SQL: &str = "
    INSERT INTO event (instance_id, event_kind, version, timestamp, payload)
    VALUES (?1, ?2, ?3, ?4, ?5)
";

const SELECT_ALL_SQL: &str = "SELECT payload FROM event ORDER BY instance_id, version ASC";

const SELECT_BY_INSTANCE_SQL: &str =
    "SELECT payload FROM event WHERE instance_id = ?1 ORDER BY version ASC";

const DELETE_OLDER_THAN_SQL: &str = "DELETE FROM event WHERE timestamp < ?1";

// Ties on timestamp keep the higher version.
const DELETE_EXCESS_EVENTS_SQL: &str = "
    DELETE FROM event
    WHERE instance_id = ?1
    AND id NOT IN (
        SELECT id FROM event
        WHERE instance_id = ?1
        ORDER BY timestamp DESC, version DESC
        LIMIT ?2
    )
";

const SELECT_DISTINCT_INSTANCE_IDS_SQL: &str = "SELECT DISTINCT instance_id FROM event";

/// Smallest stored millisecond value that is not before `cutoff`
///
/// Stored timestamps are whole milliseconds, so a cutoff inside a millisecond
/// rounds up: every row in that millisecond lies before it.
fn cutoff_millis(cutoff: DateTime<Utc>) -> i64 {
    let millis = cutoff.timestamp_millis();
    if cutoff.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Event repository over a single SQLite connection
///
/// Several repositories (one per process or replica) may open the same
/// database file; the `(instance_id, version)` constraint arbitrates between
/// them.
pub struct SqliteEventRepository {
    conn: Mutex<Connection>,
    serializer: EventSerializer,
}

impl SqliteEventRepository {
    /// Open (and create if needed) the database described by `config`
    pub fn open(config: &StorageConfig) -> JournalResult<Self> {
        if let Some(parent) = config.database_path().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            config.database_path(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(config.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> JournalResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> JournalResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            serializer: EventSerializer::new(),
        })
    }

    /// Number of stored rows, optionally for one instance only
    pub fn count_events(&self, instance: Option<&str>) -> JournalResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = match instance {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM event WHERE instance_id = ?1",
                params![id],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM event", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    fn insert_row(conn: &Connection, event: &InstanceEvent, payload: &str) -> JournalResult<()> {
        conn.prepare_cached(INSERT_SQL)?.execute(params![
            event.instance,
            event.kind().as_str(),
            event.version,
            event.timestamp_millis(),
            payload,
        ])?;
        Ok(())
    }

    fn insert_all(conn: &mut Connection, rows: &[(&InstanceEvent, String)]) -> JournalResult<usize> {
        let tx = conn.transaction()?;
        for (event, payload) in rows {
            Self::insert_row(&tx, event, payload)?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Run a payload query and decode the rows that can be decoded
    fn query_events<P: Params>(&self, sql: &str, params: P) -> JournalResult<Vec<InstanceEvent>> {
        let payloads: Vec<Option<String>> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, |row| {
                Ok(row.get_ref(0)?.as_str().ok().map(str::to_owned))
            })?;
            let payloads = rows.collect::<Result<Vec<_>, _>>()?;
            payloads
        };

        let total = payloads.len();
        let events: Vec<InstanceEvent> = payloads
            .iter()
            .filter_map(|payload| {
                payload
                    .as_deref()
                    .and_then(|json| self.serializer.deserialize(json))
            })
            .collect();

        let skipped = total - events.len();
        if skipped > 0 {
            warn!(skipped, total, "Skipped undecodable event rows");
        }

        Ok(events)
    }
}

impl EventRepository for SqliteEventRepository {
    fn save(&self, event: &InstanceEvent) -> JournalResult<()> {
        let payload = self.serializer.serialize(event)?;
        let conn = self.conn.lock();
        Self::insert_row(&conn, event, &payload)?;

        debug!(instance = %event.instance, version = event.version, kind = %event.kind(), "Persisted event");
        Ok(())
    }

    fn save_batch(&self, events: &[InstanceEvent]) -> JournalResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        // An event that cannot be encoded is lost; the rest of the batch is not.
        let rows: Vec<(&InstanceEvent, String)> = events
            .iter()
            .filter_map(|event| match self.serializer.serialize(event) {
                Ok(payload) => Some((event, payload)),
                Err(e) => {
                    error!(error = %e, "Dropping event that cannot be serialized");
                    None
                }
            })
            .collect();

        let mut conn = self.conn.lock();
        match Self::insert_all(&mut conn, &rows) {
            Ok(inserted) => {
                debug!(count = inserted, "Batch persisted events");
                Ok(inserted)
            }
            Err(e) if e.is_duplicate_key() => {
                warn!(error = %e, "Batch insert had duplicates, falling back to individual inserts");

                let mut inserted = 0;
                let mut last_failure = None;
                for (event, payload) in &rows {
                    match Self::insert_row(&conn, event, payload) {
                        Ok(()) => inserted += 1,
                        Err(e) if e.is_duplicate_key() => {
                            debug!(instance = %event.instance, version = event.version, "Event already persisted by a peer");
                        }
                        Err(e) => {
                            error!(instance = %event.instance, version = event.version, error = %e, "Failed to persist event");
                            last_failure = Some(e);
                        }
                    }
                }

                match last_failure {
                    Some(e) if inserted == 0 => Err(e),
                    _ => Ok(inserted),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn load_all(&self) -> Vec<InstanceEvent> {
        match self.query_events(SELECT_ALL_SQL, []) {
            Ok(events) => {
                info!(count = events.len(), "Loaded events from database");
                events
            }
            Err(e) => {
                warn!(error = %e, "Could not load events from database (may be first run)");
                Vec::new()
            }
        }
    }

    fn load_by_instance_id(&self, instance: &str) -> Vec<InstanceEvent> {
        match self.query_events(SELECT_BY_INSTANCE_SQL, params![instance]) {
            Ok(events) => {
                debug!(instance, count = events.len(), "Loaded events for instance from database");
                events
            }
            Err(e) => {
                warn!(instance, error = %e, "Could not load events for instance");
                Vec::new()
            }
        }
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> JournalResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(DELETE_OLDER_THAN_SQL, params![cutoff_millis(cutoff)])?;

        info!(deleted, cutoff = %cutoff, "Deleted events older than cutoff");
        Ok(deleted)
    }

    fn delete_excess_events_for_instance(&self, instance: &str, keep: usize) -> JournalResult<usize> {
        let keep = i64::try_from(keep).map_err(|_| {
            JournalError::InvalidConfig(format!("keep count out of range: {}", keep))
        })?;

        let conn = self.conn.lock();
        let deleted = conn.execute(DELETE_EXCESS_EVENTS_SQL, params![instance, keep])?;

        if deleted > 0 {
            info!(instance, deleted, "Deleted excess events for instance");
        }
        Ok(deleted)
    }

    fn distinct_instance_ids(&self) -> JournalResult<BTreeSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(SELECT_DISTINCT_INSTANCE_IDS_SQL)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Registration, StatusInfo};
    use chrono::{Duration, SubsecRound};

    fn registered(instance: &str, version: i64) -> InstanceEvent {
        InstanceEvent::registered(instance, version, Registration::new(instance, "http://x/health"))
    }

    fn status_at(instance: &str, version: i64, timestamp: DateTime<Utc>) -> InstanceEvent {
        InstanceEvent::with_timestamp(
            instance,
            version,
            timestamp,
            crate::types::EventPayload::StatusChanged {
                status_info: StatusInfo::of_up(),
            },
        )
    }

    fn insert_raw(repo: &SqliteEventRepository, instance: &str, version: i64, payload: &str) {
        repo.conn
            .lock()
            .execute(
                INSERT_SQL,
                params![instance, "STATUS_CHANGED", version, 0i64, payload],
            )
            .unwrap();
    }

    #[test]
    fn test_save_and_load_by_instance() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();

        repo.save(&registered("svc-1", 1)).unwrap();
        repo.save(&InstanceEvent::status_changed("svc-1", 2, StatusInfo::of_up()))
            .unwrap();
        repo.save(&registered("svc-2", 1)).unwrap();

        let events = repo.load_by_instance_id("svc-1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].version, 1);
        assert_eq!(events[1].version, 2);
        assert!(repo.load_by_instance_id("missing").is_empty());
    }

    #[test]
    fn test_save_duplicate_is_reported_as_duplicate_key() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.save(&registered("svc-1", 1)).unwrap();

        let err = repo.save(&registered("svc-1", 1)).unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[test]
    fn test_save_batch_with_duplicates_keeps_new_members() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.save(&registered("svc-1", 1)).unwrap();

        let batch = vec![
            registered("svc-1", 1),
            InstanceEvent::status_changed("svc-1", 2, StatusInfo::of_up()),
            InstanceEvent::status_changed("svc-1", 3, StatusInfo::of_down()),
        ];
        let inserted = repo.save_batch(&batch).unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(repo.count_events(Some("svc-1")).unwrap(), 3);
    }

    #[test]
    fn test_save_batch_empty_is_noop() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        assert_eq!(repo.save_batch(&[]).unwrap(), 0);
        assert_eq!(repo.count_events(None).unwrap(), 0);
    }

    #[test]
    fn test_load_all_orders_by_instance_then_version() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.save_batch(&[
            InstanceEvent::status_changed("b", 2, StatusInfo::of_up()),
            registered("b", 1),
            registered("a", 1),
        ])
        .unwrap();

        let keys: Vec<(String, i64)> = repo
            .load_all()
            .into_iter()
            .map(|e| (e.instance, e.version))
            .collect();
        assert_eq!(
            keys,
            vec![("a".to_string(), 1), ("b".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.save(&registered("svc-1", 1)).unwrap();
        insert_raw(&repo, "svc-1", 2, "{\"garbage\": true");
        repo.save(&InstanceEvent::status_changed("svc-1", 3, StatusInfo::of_up()))
            .unwrap();

        let versions: Vec<i64> = repo.load_all().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 3]);
        assert_eq!(repo.load_by_instance_id("svc-1").len(), 2);
    }

    #[test]
    fn test_load_all_without_table_is_empty() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.conn.lock().execute_batch("DROP TABLE event").unwrap();

        assert!(repo.load_all().is_empty());
    }

    #[test]
    fn test_delete_older_than_is_exact_and_idempotent() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        let now = Utc::now().trunc_subsecs(3);
        let cutoff = now - Duration::days(30);

        repo.save_batch(&[
            status_at("svc-1", 1, now - Duration::days(45)),
            status_at("svc-1", 2, now - Duration::days(31)),
            status_at("svc-1", 3, cutoff),
            status_at("svc-1", 4, now),
        ])
        .unwrap();

        assert_eq!(repo.delete_older_than(cutoff).unwrap(), 2);
        assert_eq!(repo.delete_older_than(cutoff).unwrap(), 0);

        let versions: Vec<i64> = repo.load_by_instance_id("svc-1").iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![3, 4]);
    }

    #[test]
    fn test_delete_older_than_with_sub_millisecond_cutoff() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        let base = Utc::now().trunc_subsecs(3);

        repo.save_batch(&[
            status_at("svc-1", 1, base + Duration::microseconds(200)),
            status_at("svc-1", 2, base + Duration::milliseconds(1)),
        ])
        .unwrap();

        assert_eq!(repo.delete_older_than(base + Duration::microseconds(900)).unwrap(), 1);
        let versions: Vec<i64> = repo.load_by_instance_id("svc-1").iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2]);

        assert_eq!(repo.delete_older_than(base + Duration::milliseconds(1)).unwrap(), 0);
    }

    #[test]
    fn test_delete_excess_keeps_newest() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        let base = Utc::now() - Duration::hours(1);
        let events: Vec<InstanceEvent> = (1..=5)
            .map(|v| status_at("svc-1", v, base + Duration::seconds(v)))
            .collect();
        repo.save_batch(&events).unwrap();
        repo.save(&registered("svc-2", 1)).unwrap();

        assert_eq!(repo.delete_excess_events_for_instance("svc-1", 2).unwrap(), 3);
        assert_eq!(repo.delete_excess_events_for_instance("svc-1", 2).unwrap(), 0);

        let versions: Vec<i64> = repo.load_by_instance_id("svc-1").iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![4, 5]);
        assert_eq!(repo.count_events(Some("svc-2")).unwrap(), 1);
    }

    #[test]
    fn test_delete_excess_with_equal_timestamps_prefers_higher_versions() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        let ts = Utc::now();
        let events: Vec<InstanceEvent> = (1..=4).map(|v| status_at("svc-1", v, ts)).collect();
        repo.save_batch(&events).unwrap();

        assert_eq!(repo.delete_excess_events_for_instance("svc-1", 3).unwrap(), 1);
        let versions: Vec<i64> = repo.load_by_instance_id("svc-1").iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[test]
    fn test_distinct_instance_ids() {
        let repo = SqliteEventRepository::open_in_memory().unwrap();
        repo.save(&registered("b", 1)).unwrap();
        repo.save(&registered("a", 1)).unwrap();
        repo.save(&InstanceEvent::status_changed("a", 2, StatusInfo::of_up()))
            .unwrap();

        let ids: Vec<String> = repo.distinct_instance_ids().unwrap().into_iter().collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
