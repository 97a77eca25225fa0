use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::engine::{check_conflicts, overlapping_start_times, DetectorConfig, Engine, TheaterLocks};
use crate::model::*;
use crate::notify::{BatchEvent, EventBus};
use crate::observability;

use super::fanout::TicketFanout;
use super::{CommitMode, SchedulerError};

/// Drives one batch from `Requested` to a terminal state.
///
/// `Err` is reserved for infrastructure failures (storage, catalog outage)
/// that the queue may retry; every business outcome, including missing
/// movies and failed fan-out, is settled and returned as `Ok`.
pub struct BatchLifecycle {
    engine: Arc<Engine>,
    catalog: Arc<dyn Catalog>,
    bus: Arc<EventBus>,
    fanout: TicketFanout,
    detector: DetectorConfig,
    commit_mode: CommitMode,
}

impl BatchLifecycle {
    pub fn new(
        engine: Arc<Engine>,
        catalog: Arc<dyn Catalog>,
        bus: Arc<EventBus>,
        detector: DetectorConfig,
        commit_mode: CommitMode,
    ) -> Self {
        Self {
            engine,
            fanout: TicketFanout::new(catalog.clone()),
            catalog,
            bus,
            detector,
            commit_mode,
        }
    }

    pub async fn run(&self, batch_id: Ulid) -> Result<BatchState, SchedulerError> {
        let record = self
            .engine
            .batch(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;

        if let Some(outcome) = record.outcome {
            let state = outcome.state();
            debug!("batch {batch_id} already {}, re-publishing", state.as_str());
            self.bus.publish(&BatchEvent::from_outcome(batch_id, outcome));
            return Ok(state);
        }

        let started = Instant::now();
        self.engine.mark_processing(batch_id)?;
        info!("batch {batch_id} processing");
        self.bus.publish(&BatchEvent::Processing { batch_id });

        // Settled inside `decide`; published here, once the locks are gone.
        let outcome = self.decide(&record.request, started).await?;
        let state = outcome.state();
        self.bus.publish(&BatchEvent::from_outcome(batch_id, outcome));
        Ok(state)
    }

    /// Settle a batch as `Error` after its job was given up on, removing
    /// anything a failed attempt left behind. No-op if already terminal.
    pub async fn abandon(&self, batch_id: Ulid, message: String) -> Result<(), SchedulerError> {
        let record = self
            .engine
            .batch(&batch_id)
            .ok_or(SchedulerError::UnknownBatch(batch_id))?;
        if record.outcome.is_some() {
            return Ok(());
        }
        let started = Instant::now();
        let outcome = {
            let mut locks = self.engine.lock_theaters(&record.request.theater_ids).await;
            if self.settled_outcome(&batch_id).is_some() {
                return Ok(());
            }
            self.compensate_leftovers(&mut locks, batch_id).await?;
            self.settle(batch_id, BatchOutcome::Error { message }, started)
                .await?
        };
        self.bus.publish(&BatchEvent::from_outcome(batch_id, outcome));
        Ok(())
    }

    /// Work out and persist the outcome. Anything touching showtimes runs
    /// under the theater locks, up to and including the settle record.
    async fn decide(
        &self,
        request: &BatchRequest,
        started: Instant,
    ) -> Result<BatchOutcome, SchedulerError> {
        let batch_id = request.batch_id;
        if let Some(message) = self.missing_references(request).await? {
            return self.settle(batch_id, BatchOutcome::Error { message }, started).await;
        }
        if let Some((a, b)) = overlapping_start_times(request, &self.detector) {
            let message = format!("Requested start times {a} and {b} overlap");
            return self.settle(batch_id, BatchOutcome::Error { message }, started).await;
        }

        // Held until the outcome is written, so batches sharing a theater
        // see each other's showtimes and a second run of this batch sees
        // it settled.
        let mut locks = self.engine.lock_theaters(&request.theater_ids).await;
        if let Some(outcome) = self.settled_outcome(&batch_id) {
            debug!("batch {batch_id} settled by another run");
            return Ok(outcome);
        }
        self.compensate_leftovers(&mut locks, batch_id).await?;

        let conflicts = check_conflicts(request, &self.detector, |id| locks.get(id));
        let outcome = if !conflicts.is_empty() {
            BatchOutcome::Fail { conflicts }
        } else {
            match self.commit_mode {
                CommitMode::Atomic => self.commit_atomic(&mut locks, request).await?,
                CommitMode::Compensating => self.commit_compensating(&mut locks, request).await?,
            }
        };
        let outcome = self.settle(batch_id, outcome, started).await?;
        drop(locks);
        Ok(outcome)
    }

    fn settled_outcome(&self, batch_id: &Ulid) -> Option<BatchOutcome> {
        self.engine.batch(batch_id).and_then(|r| r.outcome)
    }

    /// "Movie with ID … not found" / "Theater with ID … not found", or None.
    async fn missing_references(
        &self,
        request: &BatchRequest,
    ) -> Result<Option<String>, SchedulerError> {
        if !self.catalog.movie_exists(request.movie_id).await? {
            return Ok(Some(format!("Movie with ID {} not found", request.movie_id)));
        }
        let missing = self.catalog.missing_theaters(&request.theater_ids).await?;
        Ok(match missing.as_slice() {
            [] => None,
            [id] => Some(format!("Theater with ID {id} not found")),
            ids => {
                let ids: Vec<String> = ids.iter().map(Ulid::to_string).collect();
                Some(format!("Theaters with IDs {} not found", ids.join(", ")))
            }
        })
    }

    /// Showtimes and tickets land in one record; a fan-out failure writes
    /// nothing.
    async fn commit_atomic(
        &self,
        locks: &mut TheaterLocks,
        request: &BatchRequest,
    ) -> Result<BatchOutcome, SchedulerError> {
        let showtimes = request.plan_showtimes();
        let tickets = match self.fanout.plan(&showtimes).await {
            Ok(tickets) => tickets,
            Err(e) => {
                warn!("batch {} fan-out failed: {e}", request.batch_id);
                return Ok(BatchOutcome::Error {
                    message: format!("Ticket fan-out failed: {e}"),
                });
            }
        };
        let ticket_count = tickets.len() as u64;
        self.engine
            .commit_batch(locks, request.batch_id, showtimes.clone(), tickets)
            .await?;
        metrics::counter!(observability::TICKETS_CREATED_TOTAL).increment(ticket_count);
        Ok(BatchOutcome::Complete { showtimes })
    }

    /// Write showtimes, then tickets; if the tickets fail, delete the
    /// showtimes again and check that all of them went.
    async fn commit_compensating(
        &self,
        locks: &mut TheaterLocks,
        request: &BatchRequest,
    ) -> Result<BatchOutcome, SchedulerError> {
        let batch_id = request.batch_id;
        let showtimes = self.engine.create_showtimes(locks, request).await?;

        let error = match self.fanout.create_for_showtimes(&self.engine, &showtimes).await {
            Ok(tickets) => {
                metrics::counter!(observability::TICKETS_CREATED_TOTAL)
                    .increment(tickets.len() as u64);
                return Ok(BatchOutcome::Complete { showtimes });
            }
            Err(e) => e,
        };

        warn!("batch {batch_id} fan-out failed, compensating: {error}");
        metrics::counter!(observability::COMPENSATIONS_TOTAL).increment(1);
        let mut message = format!("Ticket fan-out failed: {error}");
        let deleted = self.engine.delete_showtimes_by_batch(locks, batch_id).await?;
        let created = showtimes.len();
        if deleted != created {
            error!(
                "batch {batch_id} compensation removed {deleted} of {created} showtimes, data left orphaned"
            );
            metrics::counter!(observability::COMPENSATION_MISMATCH_TOTAL).increment(1);
            message.push_str(&format!(
                " (compensation removed {deleted} of {created} showtimes)"
            ));
        }
        Ok(BatchOutcome::Error { message })
    }

    /// Remove showtimes an interrupted earlier attempt left for this batch.
    async fn compensate_leftovers(
        &self,
        locks: &mut TheaterLocks,
        batch_id: Ulid,
    ) -> Result<(), SchedulerError> {
        let removed = self.engine.delete_showtimes_by_batch(locks, batch_id).await?;
        if removed > 0 {
            warn!("batch {batch_id}: removed {removed} showtimes left by an earlier attempt");
            metrics::counter!(observability::COMPENSATIONS_TOTAL).increment(1);
        }
        Ok(())
    }

    /// Persist the outcome and record it; publishing is left to the caller.
    async fn settle(
        &self,
        batch_id: Ulid,
        outcome: BatchOutcome,
        started: Instant,
    ) -> Result<BatchOutcome, SchedulerError> {
        let state = outcome.state();
        let label = observability::outcome_label(state);
        self.engine.settle(batch_id, outcome.clone()).await?;

        metrics::counter!(observability::BATCHES_SETTLED_TOTAL, "outcome" => label).increment(1);
        metrics::histogram!(observability::BATCH_DURATION_SECONDS, "outcome" => label)
            .record(started.elapsed().as_secs_f64());
        match &outcome {
            BatchOutcome::Complete { showtimes } => {
                info!("batch {batch_id} complete: {} showtimes", showtimes.len())
            }
            BatchOutcome::Fail { conflicts } => {
                metrics::histogram!(observability::BATCH_CONFLICTS).record(conflicts.len() as f64);
                info!("batch {batch_id} failed: {} conflicts", conflicts.len())
            }
            BatchOutcome::Error { message } => info!("batch {batch_id} error: {message}"),
        }
        Ok(outcome)
    }
}
