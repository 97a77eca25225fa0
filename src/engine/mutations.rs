use std::collections::HashSet;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, TheaterLocks, WalCommand};

fn ensure_locked<'a>(
    locks: &TheaterLocks,
    theater_ids: impl IntoIterator<Item = &'a Ulid>,
) -> Result<(), EngineError> {
    for id in theater_ids {
        if !locks.holds(id) {
            return Err(EngineError::TheaterNotLocked(*id));
        }
    }
    Ok(())
}

impl Engine {
    /// Persist a freshly allocated batch in `Requested` state.
    pub async fn record_request(&self, request: BatchRequest) -> Result<(), EngineError> {
        if self.store.contains_batch(&request.batch_id) {
            return Err(EngineError::AlreadyExists(request.batch_id));
        }
        if request.slot_count() > MAX_SHOWTIMES_PER_BATCH {
            return Err(EngineError::LimitExceeded("too many showtimes in batch"));
        }
        let event = Event::BatchRequested { request };
        self.persist_and_apply(&event, &mut ()).await
    }

    /// Processing is not persisted: an interrupted batch is simply rerun.
    pub fn mark_processing(&self, batch_id: Ulid) -> Result<(), EngineError> {
        if self.store.set_state(&batch_id, BatchState::Processing) {
            Ok(())
        } else {
            Err(EngineError::UnknownBatch(batch_id))
        }
    }

    /// Record the terminal outcome of a batch.
    pub async fn settle(&self, batch_id: Ulid, outcome: BatchOutcome) -> Result<(), EngineError> {
        if !self.store.contains_batch(&batch_id) {
            return Err(EngineError::UnknownBatch(batch_id));
        }
        let event = Event::BatchSettled { batch_id, outcome };
        self.persist_and_apply(&event, &mut ()).await
    }

    /// Persist one showtime per theater × start time, tagged with the batch id.
    pub async fn create_showtimes(
        &self,
        locks: &mut TheaterLocks,
        request: &BatchRequest,
    ) -> Result<Vec<Showtime>, EngineError> {
        ensure_locked(locks, &request.theater_ids)?;
        let showtimes = request.plan_showtimes();
        let event = Event::ShowtimesCreated {
            batch_id: request.batch_id,
            showtimes: showtimes.clone(),
        };
        self.persist_and_apply(&event, locks).await?;
        Ok(showtimes)
    }

    /// Remove every showtime of the batch together with its tickets and return
    /// how many showtimes were removed. Zero, with nothing written, when the
    /// batch has none.
    pub async fn delete_showtimes_by_batch(
        &self,
        locks: &mut TheaterLocks,
        batch_id: Ulid,
    ) -> Result<usize, EngineError> {
        let showtime_ids = self.store.showtime_ids_for_batch(&batch_id);
        if showtime_ids.is_empty() {
            return Ok(0);
        }
        let theaters: HashSet<Ulid> = showtime_ids
            .iter()
            .filter_map(|id| self.store.theater_of(id))
            .collect();
        ensure_locked(locks, &theaters)?;

        let event = Event::ShowtimesDeleted {
            batch_id,
            showtime_ids: showtime_ids.clone(),
        };
        let _gate = self.wal_gate.read().await;
        self.wal_append(&event).await?;
        Ok(self.store.remove_showtimes(&batch_id, &showtime_ids, locks))
    }

    /// Persist tickets for existing showtimes as one record.
    pub async fn create_tickets(&self, tickets: Vec<Ticket>) -> Result<Vec<Ticket>, EngineError> {
        if tickets.is_empty() {
            return Ok(tickets);
        }
        if let Some(orphan) = tickets
            .iter()
            .find(|t| self.store.showtime(&t.showtime_id).is_none())
        {
            return Err(EngineError::UnknownShowtime(orphan.showtime_id));
        }
        let event = Event::TicketsCreated {
            tickets: tickets.clone(),
        };
        self.persist_and_apply(&event, &mut ()).await?;
        Ok(tickets)
    }

    /// Showtimes and their tickets as a single WAL record: after a crash
    /// either both are replayed or neither is.
    pub async fn commit_batch(
        &self,
        locks: &mut TheaterLocks,
        batch_id: Ulid,
        showtimes: Vec<Showtime>,
        tickets: Vec<Ticket>,
    ) -> Result<(), EngineError> {
        ensure_locked(locks, showtimes.iter().map(|s| &s.theater_id))?;
        let planned: HashSet<Ulid> = showtimes.iter().map(|s| s.id).collect();
        if let Some(orphan) = tickets.iter().find(|t| !planned.contains(&t.showtime_id)) {
            return Err(EngineError::UnknownShowtime(orphan.showtime_id));
        }
        let event = Event::BatchCommitted {
            batch_id,
            showtimes,
            tickets,
        };
        self.persist_and_apply(&event, locks).await
    }

    /// Rewrite the WAL with the minimal record set for the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.wal_gate.write().await;

        let mut batch_ids = self.store.batch_ids();
        batch_ids.sort();

        let mut events = Vec::new();
        for batch_id in batch_ids {
            let Some(record) = self.store.batch(&batch_id) else {
                continue;
            };
            events.push(Event::BatchRequested {
                request: record.request,
            });

            let showtimes = self.store.showtimes_for_batch(&batch_id);
            if !showtimes.is_empty() {
                let tickets = showtimes
                    .iter()
                    .flat_map(|s| self.store.tickets_for_showtime(&s.id))
                    .collect();
                events.push(Event::BatchCommitted {
                    batch_id,
                    showtimes,
                    tickets,
                });
            }

            if let Some(outcome) = record.outcome {
                events.push(Event::BatchSettled { batch_id, outcome });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
