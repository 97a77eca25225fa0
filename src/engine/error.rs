use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// No batch with this id was ever requested.
    UnknownBatch(Ulid),
    AlreadyExists(Ulid),
    /// Tickets referenced a showtime that is not stored (or not in the same commit).
    UnknownShowtime(Ulid),
    /// A write referenced a theater whose lock the caller does not hold.
    TheaterNotLocked(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownBatch(id) => write!(f, "unknown batch: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnknownShowtime(id) => write!(f, "unknown showtime: {id}"),
            EngineError::TheaterNotLocked(id) => {
                write!(f, "theater {id} is not locked by this writer")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
