mod conflict;
mod error;
mod fields;
mod mutations;
mod queries;
mod store;

pub use error::{EngineError, ValidationError};
use store::InMemoryStore;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{error, info};

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// The log operations a group commit needs.
trait BatchLog {
    fn append_buffered(&mut self, event: &Event) -> io::Result<()>;
    fn flush_sync(&mut self) -> io::Result<()>;
    /// Restore the log to its length after the last successful flush.
    fn rollback(&mut self) -> io::Result<()>;
}

impl BatchLog for Wal {
    fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        Wal::append_buffered(self, event)
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        Wal::flush_sync(self)
    }

    fn rollback(&mut self) -> io::Result<()> {
        Wal::rollback(self)
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch.
/// 4. Answer every sender with the batch result.
///
/// A failed batch is rolled back before anyone is answered. If even that
/// fails the writer stops and every later append errors.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        if !commit_batch(&mut wal, &mut batch) {
            return;
        }
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// Write, sync and answer one batch. Returns false when the log could not be
/// restored after a failure and must not be written again.
fn commit_batch(log: &mut impl BatchLog, batch: &mut Vec<PendingAppend>) -> bool {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(log, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let mut usable = true;
    if let Err(e) = &result {
        if let Err(rollback_err) = log.rollback() {
            error!("WAL rollback after failed batch ({e}) failed: {rollback_err}; refusing further writes");
            usable = false;
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
    usable
}

fn flush_batch(log: &mut impl BatchLog, batch: &[PendingAppend]) -> io::Result<()> {
    for (event, _) in batch {
        log.append_buffered(event)?;
    }
    log.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The reservation engine: vehicle calendars, user profiles and the WAL
/// that makes them durable.
///
/// Each vehicle sits behind its own `RwLock`. A booking holds the vehicle's
/// write lock from the conflict check until its WAL record is durable and
/// applied, so readers see all of a booking or none of it.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes registrations (id and plate uniqueness) and compaction.
    pub(super) registry: Mutex<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply_event(event);
        }
        info!(
            "replayed {} events from {}: {} vehicles, {} users",
            events.len(),
            wal_path.display(),
            store.vehicle_count(),
            store.user_count()
        );

        Ok(Self {
            store,
            wal_tx,
            registry: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_user(&self, id: &UserId) -> Option<UserProfile> {
        self.store.get_user(id)
    }
}
