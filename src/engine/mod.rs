mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use conflict::{check_conflicts, overlapping_start_times, DetectorConfig, TimeSlotIndex};
pub use error::EngineError;
pub use store::{BatchRecord, InMemoryStore, ScheduleAccess};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<TheaterSchedule>>;

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

/// Owns the WAL. Every wake-up drains whatever appends are already queued and
/// commits them with a single fsync; a control command ends the window early
/// and runs after the appends ahead of it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut pending: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut control = None;
        match first {
            WalCommand::Append { event, response } => pending.push((event, response)),
            other => control = Some(other),
        }
        while control.is_none() {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => pending.push((event, response)),
                Ok(other) => control = Some(other),
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            group_commit(&mut wal, &mut pending);
        }
        if let Some(cmd) = control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn group_commit(wal: &mut Wal, pending: &mut Vec<PendingAppend>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(pending.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in pending.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes do not leak
    // into the next group.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in pending.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Write locks on a set of theater schedules, taken in ascending id order so
/// that overlapping lock sets never deadlock. Holding this across a conflict
/// check and the following write serializes batches that share a theater.
pub struct TheaterLocks {
    guards: BTreeMap<Ulid, OwnedRwLockWriteGuard<TheaterSchedule>>,
}

impl TheaterLocks {
    pub fn get(&self, theater_id: &Ulid) -> Option<&TheaterSchedule> {
        self.guards.get(theater_id).map(|g| &**g)
    }

    pub fn holds(&self, theater_id: &Ulid) -> bool {
        self.guards.contains_key(theater_id)
    }

    pub fn theater_ids(&self) -> impl Iterator<Item = &Ulid> {
        self.guards.keys()
    }
}

impl ScheduleAccess for TheaterLocks {
    fn schedule_mut(&mut self, theater_id: Ulid) -> Option<&mut TheaterSchedule> {
        self.guards.get_mut(&theater_id).map(|g| &mut **g)
    }
}

/// Showtime and ticket store: per-theater timelines plus cross-theater
/// indexes, rebuilt from the WAL at startup.
pub struct Engine {
    pub(super) schedules: DashMap<Ulid, SharedSchedule>,
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Appends hold it shared; compaction holds it exclusively so the snapshot
    /// and the file swap see the same state.
    pub(super) wal_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        let mut replayed: HashMap<Ulid, TheaterSchedule> = HashMap::new();
        for event in &events {
            store.apply_event(event, &mut replayed);
        }
        let schedules: DashMap<Ulid, SharedSchedule> = replayed
            .into_iter()
            .map(|(id, schedule)| (id, Arc::new(RwLock::new(schedule))))
            .collect();

        if !events.is_empty() {
            info!(
                "replayed {} WAL records: {} batches, {} theaters",
                events.len(),
                store.batch_count(),
                schedules.len()
            );
        }

        Ok(Self {
            schedules,
            store,
            wal_tx,
            wal_gate: RwLock::new(()),
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

    /// WAL-append then apply, under the shared side of the compaction gate.
    pub(super) async fn persist_and_apply(
        &self,
        event: &Event,
        schedules: &mut dyn ScheduleAccess,
    ) -> Result<(), EngineError> {
        let _gate = self.wal_gate.read().await;
        self.wal_append(event).await?;
        self.store.apply_event(event, schedules);
        Ok(())
    }

    /// Schedule handle for a theater, created empty on first use.
    pub fn schedule(&self, theater_id: Ulid) -> SharedSchedule {
        self.schedules
            .entry(theater_id)
            .or_insert_with(|| Arc::new(RwLock::new(TheaterSchedule::new(theater_id))))
            .value()
            .clone()
    }

    /// Acquire write locks on every listed theater (duplicates ignored).
    pub async fn lock_theaters(&self, theater_ids: &[Ulid]) -> TheaterLocks {
        let mut ids = theater_ids.to_vec();
        ids.sort();
        ids.dedup();

        let mut guards = BTreeMap::new();
        for id in ids {
            let guard = self.schedule(id).write_owned().await;
            guards.insert(id, guard);
        }
        TheaterLocks { guards }
    }
}
