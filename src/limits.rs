use crate::model::Ms;

pub const MAX_THEATERS_PER_BATCH: usize = 256;
pub const MAX_START_TIMES_PER_BATCH: usize = 512;
pub const MAX_SHOWTIMES_PER_BATCH: usize = 4096;
/// 24 hours.
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_SEATS_PER_THEATER: usize = 10_000;

/// 2000-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Upper bounds for the conflict detector tunables.
pub const MAX_GRID_STEP_MINUTES: i64 = 24 * 60;
pub const MAX_CONFLICT_LOOKBACK_MINUTES: i64 = 7 * 24 * 60;

/// Distinct batches one connection may `await` or `subscribe` to.
pub const MAX_BATCHES_WATCHED_PER_CONNECTION: usize = 1024;

/// Maximum length of one line on the wire.
pub const MAX_WIRE_LINE_LEN: usize = 1 << 20;
