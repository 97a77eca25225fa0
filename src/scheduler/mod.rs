//! Asynchronous batch scheduling: `request_batch` validates and enqueues,
//! workers run each batch through [`BatchLifecycle`], and lifecycle events go
//! out on the [`EventBus`].

mod error;
mod fanout;
mod lifecycle;
mod queue;

pub use error::SchedulerError;
pub use fanout::{FanoutError, TicketFanout};
pub use lifecycle::BatchLifecycle;
pub use queue::{JobQueue, RetryPolicy};

use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;
use ulid::Ulid;

use crate::catalog::Catalog;
use crate::engine::{DetectorConfig, Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::notify::{BatchEvent, EventBus};
use crate::observability;

/// How an accepted batch and its tickets are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitMode {
    /// Showtimes and tickets in a single WAL record.
    #[default]
    Atomic,
    /// Showtimes first, then tickets; a failed fan-out deletes the showtimes.
    Compensating,
}

impl FromStr for CommitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "atomic" => Ok(CommitMode::Atomic),
            "compensating" => Ok(CommitMode::Compensating),
            other => Err(format!("unknown commit mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub commit_mode: CommitMode,
    pub detector: DetectorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
            commit_mode: CommitMode::default(),
            detector: DetectorConfig::default(),
        }
    }
}

/// Entry point for the rest of the application.
pub struct Scheduler {
    engine: Arc<Engine>,
    bus: Arc<EventBus>,
    queue: JobQueue,
}

impl Scheduler {
    /// Start the worker pool and re-enqueue every batch a previous run
    /// accepted but never settled.
    pub async fn start(
        engine: Arc<Engine>,
        catalog: Arc<dyn Catalog>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let bus = Arc::new(EventBus::new());
        let lifecycle = Arc::new(BatchLifecycle::new(
            engine.clone(),
            catalog,
            bus.clone(),
            config.detector,
            config.commit_mode,
        ));
        let (queue, _workers) =
            JobQueue::start(lifecycle, config.workers, config.queue_capacity, config.retry);

        let unsettled = engine.unsettled_batches();
        if !unsettled.is_empty() {
            info!("re-enqueueing {} unsettled batches", unsettled.len());
        }
        for batch_id in unsettled {
            queue.enqueue(batch_id).await?;
        }

        Ok(Self { engine, bus, queue })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Validate, persist as `Requested` and enqueue. Returns as soon as the
    /// job is queued; scheduling happens on a worker.
    pub async fn request_batch(
        &self,
        movie_id: Ulid,
        theater_ids: Vec<Ulid>,
        duration_minutes: u32,
        start_times: Vec<Ms>,
    ) -> Result<Ulid, SchedulerError> {
        let request = BatchRequest::new(
            Ulid::new(),
            movie_id,
            theater_ids,
            duration_minutes,
            start_times,
        );
        validate_request(&request).map_err(SchedulerError::InvalidRequest)?;

        let batch_id = request.batch_id;
        self.engine.record_request(request).await.map_err(|e| match e {
            EngineError::LimitExceeded(msg) => SchedulerError::InvalidRequest(msg.into()),
            other => other.into(),
        })?;
        metrics::counter!(observability::BATCHES_REQUESTED_TOTAL).increment(1);
        info!("batch {batch_id} requested");

        self.queue.enqueue(batch_id).await?;
        Ok(batch_id)
    }

    /// Wait for the batch to reach a terminal state.
    pub async fn await_outcome(&self, batch_id: Ulid) -> Result<BatchOutcome, SchedulerError> {
        // Subscribe before reading the record: outcomes are persisted before
        // they are published, so one of the two always sees it.
        let mut rx = self.bus.subscribe(batch_id);
        let result = self.wait_terminal(batch_id, &mut rx).await;
        drop(rx);
        self.bus.release(&batch_id);
        result
    }

    async fn wait_terminal(
        &self,
        batch_id: Ulid,
        rx: &mut broadcast::Receiver<BatchEvent>,
    ) -> Result<BatchOutcome, SchedulerError> {
        loop {
            let record = self
                .engine
                .batch(&batch_id)
                .ok_or(SchedulerError::UnknownBatch(batch_id))?;
            if let Some(outcome) = record.outcome {
                return Ok(outcome);
            }
            match rx.recv().await {
                Ok(event) => {
                    if let Some(outcome) = event.into_outcome() {
                        return Ok(outcome);
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(SchedulerError::Shutdown),
            }
        }
    }

    /// Showtimes of a completed batch. Empty for every other state, so
    /// readers never see a batch half-written.
    pub fn find_showtimes_by_batch_id(&self, batch_id: &Ulid) -> Vec<Showtime> {
        match self.engine.batch_state(batch_id) {
            Some(BatchState::Complete) => self.engine.showtimes_for_batch(batch_id),
            _ => Vec::new(),
        }
    }

    pub fn tickets_for_showtime(&self, showtime_id: &Ulid) -> Vec<Ticket> {
        self.engine.tickets_for_showtime(showtime_id)
    }

    pub fn batch_state(&self, batch_id: &Ulid) -> Option<BatchState> {
        self.engine.batch_state(batch_id)
    }

    pub fn subscribe(&self, batch_id: Ulid) -> broadcast::Receiver<BatchEvent> {
        self.bus.subscribe(batch_id)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<BatchEvent> {
        self.bus.subscribe_all()
    }
}

fn validate_request(request: &BatchRequest) -> Result<(), String> {
    if request.theater_ids.is_empty() {
        return Err("theater_ids must not be empty".into());
    }
    if request.theater_ids.len() > MAX_THEATERS_PER_BATCH {
        return Err(format!("at most {MAX_THEATERS_PER_BATCH} theaters per batch"));
    }
    if request.start_times.is_empty() {
        return Err("start_times must not be empty".into());
    }
    if request.start_times.len() > MAX_START_TIMES_PER_BATCH {
        return Err(format!("at most {MAX_START_TIMES_PER_BATCH} start times per batch"));
    }
    if request.duration_minutes == 0 {
        return Err("duration_minutes must be positive".into());
    }
    if request.duration_minutes > MAX_DURATION_MINUTES {
        return Err(format!("duration_minutes must be at most {MAX_DURATION_MINUTES}"));
    }
    if request.slot_count() > MAX_SHOWTIMES_PER_BATCH {
        return Err(format!("at most {MAX_SHOWTIMES_PER_BATCH} showtimes per batch"));
    }
    for (i, start) in request.start_times.iter().enumerate() {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(start) {
            return Err(format!("start time {start} out of range"));
        }
        if request.start_times[..i].contains(start) {
            return Err(format!("start time {start} given twice"));
        }
    }
    Ok(())
}
