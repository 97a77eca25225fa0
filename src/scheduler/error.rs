use ulid::Ulid;

use crate::catalog::CatalogError;
use crate::engine::EngineError;

#[derive(Debug)]
pub enum SchedulerError {
    /// Rejected before a batch id was allocated.
    InvalidRequest(String),
    UnknownBatch(Ulid),
    /// The catalog could not answer; the job is retried.
    Catalog(CatalogError),
    Engine(EngineError),
    /// Workers or the event bus are gone.
    Shutdown,
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            SchedulerError::UnknownBatch(id) => write!(f, "unknown batch: {id}"),
            SchedulerError::Catalog(e) => write!(f, "{e}"),
            SchedulerError::Engine(e) => write!(f, "{e}"),
            SchedulerError::Shutdown => write!(f, "scheduler is shutting down"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<EngineError> for SchedulerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::UnknownBatch(id) => SchedulerError::UnknownBatch(id),
            other => SchedulerError::Engine(other),
        }
    }
}

impl From<CatalogError> for SchedulerError {
    fn from(e: CatalogError) -> Self {
        SchedulerError::Catalog(e)
    }
}
