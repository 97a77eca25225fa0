use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds; the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// One seat of a theater layout: block / row / number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Seat {
    pub block: String,
    pub row: String,
    pub number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    /// Only reached through the payment flow, which lives outside this crate.
    Sold,
}

/// A screening of one movie in one theater. `span.end` is always
/// `span.start + duration` of the batch that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Showtime {
    pub id: Ulid,
    pub batch_id: Ulid,
    pub movie_id: Ulid,
    pub theater_id: Ulid,
    pub span: Span,
}

impl Showtime {
    pub fn start(&self) -> Ms {
        self.span.start
    }

    pub fn end(&self) -> Ms {
        self.span.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Ulid,
    pub showtime_id: Ulid,
    pub theater_id: Ulid,
    pub movie_id: Ulid,
    pub seat: Seat,
    pub status: TicketStatus,
}

impl Ticket {
    /// A fresh, unsold ticket for `seat` at `showtime`.
    pub fn open(showtime: &Showtime, seat: Seat) -> Self {
        Self {
            id: Ulid::new(),
            showtime_id: showtime.id,
            theater_id: showtime.theater_id,
            movie_id: showtime.movie_id,
            seat,
            status: TicketStatus::Open,
        }
    }
}

/// A request to schedule `movie_id` in every theater at every start time.
/// Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: Ulid,
    pub movie_id: Ulid,
    /// Deduplicated, first-seen order preserved.
    pub theater_ids: Vec<Ulid>,
    pub duration_minutes: u32,
    pub start_times: Vec<Ms>,
}

impl BatchRequest {
    pub fn new(
        batch_id: Ulid,
        movie_id: Ulid,
        theater_ids: Vec<Ulid>,
        duration_minutes: u32,
        start_times: Vec<Ms>,
    ) -> Self {
        let mut unique = Vec::with_capacity(theater_ids.len());
        for id in theater_ids {
            if !unique.contains(&id) {
                unique.push(id);
            }
        }
        Self {
            batch_id,
            movie_id,
            theater_ids: unique,
            duration_minutes,
            start_times,
        }
    }

    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }

    /// The interval a showtime starting at `start` would occupy.
    pub fn slot(&self, start: Ms) -> Span {
        Span::new(start, start + self.duration_ms())
    }

    /// `[min(start_times), max(start_times) + duration]`. None if no start times.
    pub fn range(&self) -> Option<Span> {
        let first = self.start_times.iter().min()?;
        let last = self.start_times.iter().max()?;
        Some(Span::new(*first, *last + self.duration_ms()))
    }

    /// Number of showtimes a successful batch produces.
    pub fn slot_count(&self) -> usize {
        self.theater_ids.len() * self.start_times.len()
    }

    /// Cartesian product theaters × start times, theater-major, fresh ids.
    pub fn plan_showtimes(&self) -> Vec<Showtime> {
        let mut planned = Vec::with_capacity(self.slot_count());
        for theater_id in &self.theater_ids {
            for start in &self.start_times {
                planned.push(Showtime {
                    id: Ulid::new(),
                    batch_id: self.batch_id,
                    movie_id: self.movie_id,
                    theater_id: *theater_id,
                    span: self.slot(*start),
                });
            }
        }
        planned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Requested,
    Processing,
    Complete,
    Fail,
    Error,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Complete | BatchState::Fail | BatchState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Requested => "requested",
            BatchState::Processing => "processing",
            BatchState::Complete => "complete",
            BatchState::Fail => "fail",
            BatchState::Error => "error",
        }
    }
}

/// Terminal result of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Complete { showtimes: Vec<Showtime> },
    /// One entry per conflicting requested slot; the same showtime may repeat.
    Fail { conflicts: Vec<Showtime> },
    Error { message: String },
}

impl BatchOutcome {
    pub fn state(&self) -> BatchState {
        match self {
            BatchOutcome::Complete { .. } => BatchState::Complete,
            BatchOutcome::Fail { .. } => BatchState::Fail,
            BatchOutcome::Error { .. } => BatchState::Error,
        }
    }

    /// For callers that prefer `Error` as a failure rather than a variant.
    pub fn reject_errors(self) -> Result<BatchOutcome, String> {
        match self {
            BatchOutcome::Error { message } => Err(message),
            other => Ok(other),
        }
    }
}

/// One theater's timeline. Showtimes sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct TheaterSchedule {
    pub theater_id: Ulid,
    pub showtimes: Vec<Showtime>,
}

impl TheaterSchedule {
    pub fn new(theater_id: Ulid) -> Self {
        Self {
            theater_id,
            showtimes: Vec::new(),
        }
    }

    /// Insert showtime maintaining sort order by start.
    pub fn insert_showtime(&mut self, showtime: Showtime) {
        let pos = self
            .showtimes
            .binary_search_by_key(&showtime.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.showtimes.insert(pos, showtime);
    }

    pub fn remove_showtime(&mut self, id: Ulid) -> Option<Showtime> {
        let pos = self.showtimes.iter().position(|s| s.id == id)?;
        Some(self.showtimes.remove(pos))
    }

    /// Showtimes whose start lies in the closed range `[from, to]`.
    /// End times are deliberately not consulted.
    pub fn starting_within(&self, from: Ms, to: Ms) -> impl Iterator<Item = &Showtime> {
        let lo = self.showtimes.partition_point(|s| s.span.start < from);
        let hi = self.showtimes.partition_point(|s| s.span.start <= to);
        self.showtimes[lo..hi.max(lo)].iter()
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BatchRequested {
        request: BatchRequest,
    },
    BatchSettled {
        batch_id: Ulid,
        outcome: BatchOutcome,
    },
    ShowtimesCreated {
        batch_id: Ulid,
        showtimes: Vec<Showtime>,
    },
    TicketsCreated {
        tickets: Vec<Ticket>,
    },
    /// Showtimes and their tickets in one record: committed or absent together.
    BatchCommitted {
        batch_id: Ulid,
        showtimes: Vec<Showtime>,
        tickets: Vec<Ticket>,
    },
    /// Also drops every ticket of the listed showtimes.
    ShowtimesDeleted {
        batch_id: Ulid,
        showtime_ids: Vec<Ulid>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    fn showtime_at(theater_id: Ulid, start: Ms, end: Ms) -> Showtime {
        Showtime {
            id: Ulid::new(),
            batch_id: Ulid::new(),
            movie_id: Ulid::new(),
            theater_id,
            span: Span::new(start, end),
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert!(s.overlaps(&Span::new(150, 250)));
        assert!(!s.overlaps(&Span::new(200, 300)));
    }

    #[test]
    fn request_dedups_theaters_keeping_order() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let req = BatchRequest::new(Ulid::new(), Ulid::new(), vec![b, a, b, a], 90, vec![0]);
        assert_eq!(req.theater_ids, vec![b, a]);
        assert_eq!(req.slot_count(), 2);
    }

    #[test]
    fn request_range_covers_last_showing() {
        let req = BatchRequest::new(Ulid::new(), Ulid::new(), vec![Ulid::new()], 90, vec![14 * H, 12 * H, 16 * H]);
        assert_eq!(req.range(), Some(Span::new(12 * H, 16 * H + 90 * MINUTE_MS)));

        let empty = BatchRequest::new(Ulid::new(), Ulid::new(), vec![Ulid::new()], 90, vec![]);
        assert_eq!(empty.range(), None);
    }

    #[test]
    fn plan_is_theater_major_product() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let req = BatchRequest::new(Ulid::new(), Ulid::new(), vec![a, b], 30, vec![H, 2 * H, 3 * H]);
        let planned = req.plan_showtimes();
        assert_eq!(planned.len(), 6);
        assert!(planned[..3].iter().all(|s| s.theater_id == a));
        assert!(planned[3..].iter().all(|s| s.theater_id == b));
        assert_eq!(planned[1].span, Span::new(2 * H, 2 * H + 30 * MINUTE_MS));
        assert!(planned.iter().all(|s| s.batch_id == req.batch_id && s.movie_id == req.movie_id));
    }

    #[test]
    fn schedule_keeps_start_order() {
        let t = Ulid::new();
        let mut schedule = TheaterSchedule::new(t);
        schedule.insert_showtime(showtime_at(t, 3 * H, 4 * H));
        schedule.insert_showtime(showtime_at(t, H, 2 * H));
        schedule.insert_showtime(showtime_at(t, 2 * H, 3 * H));
        let starts: Vec<Ms> = schedule.showtimes.iter().map(|s| s.start()).collect();
        assert_eq!(starts, vec![H, 2 * H, 3 * H]);
    }

    #[test]
    fn starting_within_is_closed_and_ignores_end() {
        let t = Ulid::new();
        let mut schedule = TheaterSchedule::new(t);
        // Starts before the range but runs into it: not returned.
        schedule.insert_showtime(showtime_at(t, 0, 5 * H));
        schedule.insert_showtime(showtime_at(t, 2 * H, 3 * H));
        schedule.insert_showtime(showtime_at(t, 4 * H, 5 * H));
        schedule.insert_showtime(showtime_at(t, 6 * H, 7 * H));

        let hits: Vec<Ms> = schedule.starting_within(2 * H, 4 * H).map(|s| s.start()).collect();
        assert_eq!(hits, vec![2 * H, 4 * H]);
        assert_eq!(schedule.starting_within(8 * H, 9 * H).count(), 0);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let t = Ulid::new();
        let mut schedule = TheaterSchedule::new(t);
        let s = showtime_at(t, H, 2 * H);
        let id = s.id;
        schedule.insert_showtime(s);
        assert!(schedule.remove_showtime(Ulid::new()).is_none());
        assert_eq!(schedule.remove_showtime(id).map(|s| s.id), Some(id));
        assert!(schedule.showtimes.is_empty());
    }

    #[test]
    fn outcome_reject_errors() {
        let err = BatchOutcome::Error { message: "Movie with ID x not found".into() };
        assert_eq!(err.state(), BatchState::Error);
        assert_eq!(err.reject_errors(), Err("Movie with ID x not found".to_string()));

        let fail = BatchOutcome::Fail { conflicts: vec![] };
        assert!(fail.clone().reject_errors().is_ok());
        assert!(fail.state().is_terminal());
        assert!(!BatchState::Processing.is_terminal());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BatchRequested {
            request: BatchRequest::new(Ulid::new(), Ulid::new(), vec![Ulid::new()], 120, vec![H]),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
