use std::net::SocketAddr;

use crate::model::BatchState;

// ── Batch pipeline ──────────────────────────────────────────────

/// Counter: batches accepted by `request_batch`.
pub const BATCHES_REQUESTED_TOTAL: &str = "marquee_batches_requested_total";

/// Counter: batches reaching a terminal state. Labels: outcome.
pub const BATCHES_SETTLED_TOTAL: &str = "marquee_batches_settled_total";

/// Histogram: seconds from dequeue to terminal state. Labels: outcome.
pub const BATCH_DURATION_SECONDS: &str = "marquee_batch_duration_seconds";

/// Histogram: conflicts reported per failed batch.
pub const BATCH_CONFLICTS: &str = "marquee_batch_conflicts";

/// Counter: tickets created by fan-out.
pub const TICKETS_CREATED_TOTAL: &str = "marquee_tickets_created_total";

/// Gauge: jobs waiting in the queue.
pub const QUEUE_DEPTH: &str = "marquee_queue_depth";

/// Counter: jobs retried after an infrastructure failure.
pub const JOB_REDELIVERIES_TOTAL: &str = "marquee_job_redeliveries_total";

/// Counter: compensating deletes run after a failed fan-out or an
/// interrupted run.
pub const COMPENSATIONS_TOTAL: &str = "marquee_compensations_total";

/// Counter: compensations that removed a different number of showtimes
/// than were created. Any non-zero value means orphaned data.
pub const COMPENSATION_MISMATCH_TOTAL: &str = "marquee_compensation_mismatch_total";

// ── Connections ─────────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "marquee_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "marquee_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "marquee_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "marquee_auth_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "marquee_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "marquee_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "marquee_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Label value for the `outcome` label.
pub fn outcome_label(state: BatchState) -> &'static str {
    state.as_str()
}
