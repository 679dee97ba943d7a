//! Journal configuration
//!
//! Process-wide settings come from the environment (see [`JournalConfig::from_env`]).
//! Values that are missing, unparseable or out of range fall back to defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::JournalError;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_EVENTS_PER_INSTANCE: usize = 1000;
pub const DEFAULT_DATABASE_PATH: &str = "data/journal.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 3600;

/// What `publish_stored_events` re-emits at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPublish {
    /// Only the newest REGISTERED event of each stream. Triggers status
    /// checks without replaying historical status changes to notifiers.
    #[default]
    LatestRegistration,
    /// Every cached event of every stream
    AllEvents,
}

impl FromStr for StartupPublish {
    type Err = JournalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest-registration" | "latest_registration" | "registered" => {
                Ok(StartupPublish::LatestRegistration)
            }
            "all" | "all-events" | "all_events" => Ok(StartupPublish::AllEvents),
            other => Err(JournalError::InvalidConfig(format!(
                "unknown startup publish mode: {}",
                other
            ))),
        }
    }
}

/// Retention and publishing policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalProperties {
    retention_days: u32,
    max_events_per_instance: usize,
    publish_on_startup: bool,
    startup_publish: StartupPublish,
}

impl JournalProperties {
    /// Non-positive values fall back to the defaults.
    pub fn new(retention_days: i64, max_events_per_instance: i64, publish_on_startup: bool) -> Self {
        let retention_days = if retention_days <= 0 {
            DEFAULT_RETENTION_DAYS
        } else {
            u32::try_from(retention_days).unwrap_or(u32::MAX)
        };
        let max_events_per_instance = if max_events_per_instance <= 0 {
            DEFAULT_MAX_EVENTS_PER_INSTANCE
        } else {
            usize::try_from(max_events_per_instance).unwrap_or(usize::MAX)
        };

        Self {
            retention_days,
            max_events_per_instance,
            publish_on_startup,
            startup_publish: StartupPublish::default(),
        }
    }

    pub fn with_startup_publish(mut self, mode: StartupPublish) -> Self {
        self.startup_publish = mode;
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Per-instance cap for both the durable log and the in-memory cache
    pub fn max_events_per_instance(&self) -> usize {
        self.max_events_per_instance
    }

    pub fn publish_on_startup(&self) -> bool {
        self.publish_on_startup
    }

    pub fn startup_publish(&self) -> StartupPublish {
        self.startup_publish
    }

    /// Retention window as a chrono duration
    pub fn retention_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Build from a key lookup (environment in production, maps in tests)
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let retention_days = parse_or(&lookup, "JOURNAL_RETENTION_DAYS", 0i64);
        let max_events = parse_or(&lookup, "JOURNAL_MAX_EVENTS_PER_INSTANCE", 0i64);
        let publish_on_startup = parse_or(&lookup, "JOURNAL_PUBLISH_ON_STARTUP", true);
        let startup_publish = parse_or(&lookup, "JOURNAL_STARTUP_PUBLISH", StartupPublish::default());

        Self::new(retention_days, max_events, publish_on_startup).with_startup_publish(startup_publish)
    }
}

impl Default for JournalProperties {
    fn default() -> Self {
        Self::new(
            i64::from(DEFAULT_RETENTION_DAYS),
            DEFAULT_MAX_EVENTS_PER_INSTANCE as i64,
            true,
        )
    }
}

/// Where and how the durable log is stored
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    pub database_path: PathBuf,
    /// Upper bound on how long a statement waits for a locked database
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl StorageConfig {
    /// Create config with custom database path
    pub fn new<P: AsRef<Path>>(database_path: P) -> Self {
        Self {
            database_path: database_path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }
}

/// Everything the server binary needs
#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub storage: StorageConfig,
    pub properties: JournalProperties,
    /// How often the retention job runs
    pub retention_interval: Duration,
}

impl JournalConfig {
    /// Read configuration from `JOURNAL_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup("JOURNAL_DATABASE_PATH")
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());
        let busy_timeout_ms = parse_or(&lookup, "JOURNAL_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS);
        let interval_secs = parse_or(
            &lookup,
            "JOURNAL_RETENTION_INTERVAL_SECS",
            DEFAULT_RETENTION_INTERVAL_SECS,
        );

        Self {
            storage: StorageConfig::new(database_path)
                .with_busy_timeout(Duration::from_millis(busy_timeout_ms)),
            properties: JournalProperties::from_lookup(&lookup),
            retention_interval: Duration::from_secs(interval_secs.max(1)),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Ignoring unparseable configuration value");
                default
            }
        },
        None => default,
    }
}
