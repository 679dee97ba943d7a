//! Instance Journal - Binary Entry Point
//!
//! Opens the journal database, hydrates the event store and runs the
//! retention job on a fixed interval until interrupted.

use std::sync::Arc;

use instance_journal::config::JournalConfig;
use instance_journal::event_store::{EventBroadcaster, InstanceEventStore, RetentionService};
use instance_journal::persistence::{EventRepository, SqliteEventRepository};
use instance_journal::{JournalError, JournalResult};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> JournalResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = JournalConfig::from_env();
    info!(
        database = %config.storage.database_path().display(),
        retention_days = config.properties.retention_days(),
        max_events_per_instance = config.properties.max_events_per_instance(),
        "Starting instance journal"
    );

    let repository: Arc<dyn EventRepository> =
        Arc::new(SqliteEventRepository::open(&config.storage)?);
    let store = Arc::new(InstanceEventStore::new(
        repository.clone(),
        config.properties.clone(),
    )?);

    let broadcaster = Arc::new(EventBroadcaster::new(1024));
    store.subscribe(broadcaster.clone());

    let mut events_rx = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(msg) => {
                    for event in &msg.events {
                        info!(
                            seq = msg.sequence_id,
                            instance = %event.instance,
                            version = event.version,
                            kind = %event.kind(),
                            "Instance event"
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log consumer lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if config.properties.publish_on_startup() {
        store.publish_stored_events();
    }

    let retention = Arc::new(RetentionService::new(repository, config.properties.clone()));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .map_err(|e| JournalError::Io(std::io::Error::other(e)))?;

    let mut ticker = tokio::time::interval(config.retention_interval);
    // The first tick completes immediately; retention starts one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let retention = retention.clone();
                let store = store.clone();
                match tokio::task::spawn_blocking(move || retention.cleanup_and_reload(&store)).await {
                    Ok(Ok(report)) => info!(
                        deleted_by_age = report.deleted_by_age,
                        deleted_by_count = report.deleted_by_count,
                        "Retention run finished"
                    ),
                    Ok(Err(e)) => error!(error = %e, "Retention run failed"),
                    Err(e) => error!(error = %e, "Retention task panicked"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }

    info!("Shutting down, flushing pending writes");
    let flushed = tokio::task::spawn_blocking(move || store.flush()).await;
    if let Ok(Err(e)) = flushed {
        error!(error = %e, "Failed to flush pending writes");
    }

    Ok(())
}
