//! Background durable-write worker
//!
//! Appends hand their batches to this worker and return immediately. The
//! worker owns a dedicated thread that writes each batch through the
//! repository in arrival order. Failures are logged and not retried.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{JournalError, JournalResult};
use crate::persistence::EventRepository;
use crate::types::InstanceEvent;

enum WriteCommand {
    Persist(Vec<InstanceEvent>),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget writer in front of an [`EventRepository`]
pub struct PersistWorker {
    tx: Option<mpsc::UnboundedSender<WriteCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl PersistWorker {
    /// Start the worker thread
    pub fn spawn(repository: Arc<dyn EventRepository>) -> JournalResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCommand>();

        let handle = std::thread::Builder::new()
            .name("journal-writer".to_string())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        WriteCommand::Persist(events) => match repository.save_batch(&events) {
                            Ok(inserted) => {
                                debug!(count = events.len(), inserted, "Persisted events to database")
                            }
                            Err(e) => {
                                error!(count = events.len(), error = %e, "Failed to persist events to database")
                            }
                        },
                        WriteCommand::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                debug!("Persist worker stopped");
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a batch for durable storage without waiting for it
    pub fn enqueue(&self, events: Vec<InstanceEvent>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let sent = self
            .tx
            .as_ref()
            .map(|tx| tx.send(WriteCommand::Persist(events)).is_ok())
            .unwrap_or(false);
        if !sent {
            error!(count, "Persist worker is not running; events were not persisted");
        }
    }

    /// Block until every batch queued before this call has been written.
    ///
    /// Must not be called from inside an async task; use `spawn_blocking`.
    pub fn flush(&self) -> JournalResult<()> {
        let tx = self.tx.as_ref().ok_or(JournalError::WorkerStopped)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(WriteCommand::Flush(ack_tx))
            .map_err(|_| JournalError::WorkerStopped)?;
        ack_rx.blocking_recv().map_err(|_| JournalError::WorkerStopped)
    }
}

impl Drop for PersistWorker {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain what is queued and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Persist worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteEventRepository;
    use crate::types::StatusInfo;

    #[test]
    fn test_flush_waits_for_queued_batches() {
        let repo = Arc::new(SqliteEventRepository::open_in_memory().unwrap());
        let worker = PersistWorker::spawn(repo.clone()).unwrap();

        worker.enqueue(vec![
            InstanceEvent::status_changed("a", 1, StatusInfo::of_up()),
            InstanceEvent::status_changed("a", 2, StatusInfo::of_down()),
        ]);
        worker.enqueue(vec![InstanceEvent::deregistered("a", 3)]);
        worker.flush().unwrap();

        assert_eq!(repo.count_events(Some("a")).unwrap(), 3);
    }

    #[test]
    fn test_drop_drains_pending_writes() {
        let repo = Arc::new(SqliteEventRepository::open_in_memory().unwrap());
        {
            let worker = PersistWorker::spawn(repo.clone()).unwrap();
            worker.enqueue(vec![InstanceEvent::deregistered("b", 1)]);
        }
        assert_eq!(repo.count_events(Some("b")).unwrap(), 1);
    }
}
