use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::observability;

use super::lifecycle::BatchLifecycle;
use super::SchedulerError;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How often a job is attempted before its batch is settled as `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each further failure.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Producer side of the batch job queue. Jobs are batch ids; everything a
/// worker needs is in the engine.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Ulid>,
}

impl JobQueue {
    /// Spawn `workers` tasks sharing one bounded queue.
    pub fn start(
        lifecycle: Arc<BatchLifecycle>,
        workers: usize,
        capacity: usize,
        retry: RetryPolicy,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let lifecycle = lifecycle.clone();
                let depth = tx.downgrade();
                tokio::spawn(async move {
                    worker_loop(worker, rx, depth, lifecycle, retry).await;
                })
            })
            .collect();
        (Self { tx }, handles)
    }

    pub async fn enqueue(&self, batch_id: Ulid) -> Result<(), SchedulerError> {
        self.tx
            .send(batch_id)
            .await
            .map_err(|_| SchedulerError::Shutdown)?;
        record_depth(&self.tx);
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

fn record_depth(tx: &mpsc::Sender<Ulid>) {
    metrics::gauge!(observability::QUEUE_DEPTH).set((tx.max_capacity() - tx.capacity()) as f64);
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<Ulid>>>,
    depth: mpsc::WeakSender<Ulid>,
    lifecycle: Arc<BatchLifecycle>,
    retry: RetryPolicy,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(batch_id) = job else { break };
        if let Some(tx) = depth.upgrade() {
            record_depth(&tx);
        }
        debug!("worker {worker} picked up batch {batch_id}");
        process_job(&lifecycle, batch_id, &retry).await;
    }
    debug!("worker {worker} stopped");
}

/// Run a job to a terminal state, retrying infrastructure failures.
pub(super) async fn process_job(lifecycle: &BatchLifecycle, batch_id: Ulid, retry: &RetryPolicy) {
    let mut attempt = 1;
    loop {
        match lifecycle.run(batch_id).await {
            Ok(_) => return,
            Err(SchedulerError::UnknownBatch(_)) => {
                warn!("dropping job for unknown batch {batch_id}");
                return;
            }
            Err(e) if attempt < retry.max_attempts => {
                let delay = retry.delay(attempt);
                warn!("batch {batch_id} attempt {attempt} failed: {e}; retrying in {delay:?}");
                metrics::counter!(observability::JOB_REDELIVERIES_TOTAL).increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!("batch {batch_id} failed after {attempt} attempts: {e}");
                let message = format!("Batch processing failed after {attempt} attempts: {e}");
                if let Err(e) = lifecycle.abandon(batch_id, message).await {
                    error!("batch {batch_id} could not be settled: {e}");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(4), Duration::from_millis(800));
        assert_eq!(retry.delay(40), MAX_BACKOFF);
    }
}
