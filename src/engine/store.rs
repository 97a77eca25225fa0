use std::collections::HashMap;

use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Everything known about one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub request: BatchRequest,
    pub state: BatchState,
    pub outcome: Option<BatchOutcome>,
}

/// Mutable access to theater schedules while applying an event. Live writers
/// go through their held locks; replay goes through a plain map.
pub trait ScheduleAccess: Send {
    fn schedule_mut(&mut self, theater_id: Ulid) -> Option<&mut TheaterSchedule>;
}

/// For events that touch no schedule.
impl ScheduleAccess for () {
    fn schedule_mut(&mut self, _theater_id: Ulid) -> Option<&mut TheaterSchedule> {
        None
    }
}

impl ScheduleAccess for HashMap<Ulid, TheaterSchedule> {
    fn schedule_mut(&mut self, theater_id: Ulid) -> Option<&mut TheaterSchedule> {
        Some(
            self.entry(theater_id)
                .or_insert_with(|| TheaterSchedule::new(theater_id)),
        )
    }
}

/// Indexes that span theaters: batches, showtime ownership, tickets.
pub struct InMemoryStore {
    batches: DashMap<Ulid, BatchRecord>,
    /// showtime id → showtime
    showtimes: DashMap<Ulid, Showtime>,
    /// batch id → showtime ids, creation order
    batch_showtimes: DashMap<Ulid, Vec<Ulid>>,
    /// showtime id → tickets
    tickets: DashMap<Ulid, Vec<Ticket>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            batches: DashMap::new(),
            showtimes: DashMap::new(),
            batch_showtimes: DashMap::new(),
            tickets: DashMap::new(),
        }
    }

    // ── Batches ──────────────────────────────────────────────

    pub fn batch(&self, id: &Ulid) -> Option<BatchRecord> {
        self.batches.get(id).map(|e| e.value().clone())
    }

    pub fn contains_batch(&self, id: &Ulid) -> bool {
        self.batches.contains_key(id)
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn batch_ids(&self) -> Vec<Ulid> {
        self.batches.iter().map(|e| *e.key()).collect()
    }

    /// In-memory only transition (e.g. Processing); never written to the WAL.
    /// A terminal state is never overwritten.
    pub fn set_state(&self, id: &Ulid, state: BatchState) -> bool {
        match self.batches.get_mut(id) {
            Some(mut record) => {
                if !record.state.is_terminal() {
                    record.state = state;
                }
                true
            }
            None => false,
        }
    }

    /// Requested batches that never reached a terminal state.
    pub fn unsettled_batches(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .batches
            .iter()
            .filter(|e| !e.value().state.is_terminal())
            .map(|e| *e.key())
            .collect();
        // Ulids sort by creation time: oldest first.
        ids.sort();
        ids
    }

    // ── Showtimes ────────────────────────────────────────────

    pub fn showtime_ids_for_batch(&self, batch_id: &Ulid) -> Vec<Ulid> {
        self.batch_showtimes
            .get(batch_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn showtime(&self, showtime_id: &Ulid) -> Option<Showtime> {
        self.showtimes.get(showtime_id).map(|e| e.value().clone())
    }

    pub fn theater_of(&self, showtime_id: &Ulid) -> Option<Ulid> {
        self.showtimes.get(showtime_id).map(|e| e.value().theater_id)
    }

    /// Showtimes of a batch in creation order, read without theater locks.
    pub fn showtimes_for_batch(&self, batch_id: &Ulid) -> Vec<Showtime> {
        self.showtime_ids_for_batch(batch_id)
            .iter()
            .filter_map(|id| self.showtime(id))
            .collect()
    }

    /// Every stored showtime of a movie, ordered by start then theater.
    pub fn showtimes_for_movie(&self, movie_id: &Ulid) -> Vec<Showtime> {
        let mut found: Vec<Showtime> = self
            .showtimes
            .iter()
            .filter(|e| e.value().movie_id == *movie_id)
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|s| (s.span.start, s.theater_id));
        found
    }

    fn add_showtimes(&self, batch_id: Ulid, showtimes: &[Showtime], schedules: &mut dyn ScheduleAccess) {
        for showtime in showtimes {
            if let Some(schedule) = schedules.schedule_mut(showtime.theater_id) {
                schedule.insert_showtime(showtime.clone());
                self.showtimes.insert(showtime.id, showtime.clone());
                self.batch_showtimes.entry(batch_id).or_default().push(showtime.id);
            }
        }
    }

    /// Remove showtimes and their tickets. Returns how many showtimes were
    /// actually found and removed from a schedule.
    pub fn remove_showtimes(
        &self,
        batch_id: &Ulid,
        showtime_ids: &[Ulid],
        schedules: &mut dyn ScheduleAccess,
    ) -> usize {
        let mut removed = 0;
        for id in showtime_ids {
            self.tickets.remove(id);
            let Some((_, showtime)) = self.showtimes.remove(id) else {
                continue;
            };
            if let Some(schedule) = schedules.schedule_mut(showtime.theater_id)
                && schedule.remove_showtime(*id).is_some()
            {
                removed += 1;
            }
        }
        if let Some(mut ids) = self.batch_showtimes.get_mut(batch_id) {
            ids.retain(|id| !showtime_ids.contains(id));
        }
        self.batch_showtimes.remove_if(batch_id, |_, ids| ids.is_empty());
        removed
    }

    // ── Tickets ──────────────────────────────────────────────

    pub fn tickets_for_showtime(&self, showtime_id: &Ulid) -> Vec<Ticket> {
        self.tickets
            .get(showtime_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn ticket_count(&self, showtime_id: &Ulid) -> usize {
        self.tickets.get(showtime_id).map_or(0, |e| e.value().len())
    }

    fn add_tickets(&self, tickets: &[Ticket]) {
        for ticket in tickets {
            self.tickets
                .entry(ticket.showtime_id)
                .or_default()
                .push(ticket.clone());
        }
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_event(&self, event: &Event, schedules: &mut dyn ScheduleAccess) {
        match event {
            Event::BatchRequested { request } => {
                self.batches.insert(
                    request.batch_id,
                    BatchRecord {
                        request: request.clone(),
                        state: BatchState::Requested,
                        outcome: None,
                    },
                );
            }
            Event::BatchSettled { batch_id, outcome } => {
                if let Some(mut record) = self.batches.get_mut(batch_id) {
                    record.state = outcome.state();
                    record.outcome = Some(outcome.clone());
                }
            }
            Event::ShowtimesCreated { batch_id, showtimes } => {
                self.add_showtimes(*batch_id, showtimes, schedules);
            }
            Event::TicketsCreated { tickets } => {
                self.add_tickets(tickets);
            }
            Event::BatchCommitted {
                batch_id,
                showtimes,
                tickets,
            } => {
                self.add_showtimes(*batch_id, showtimes, schedules);
                self.add_tickets(tickets);
            }
            Event::ShowtimesDeleted {
                batch_id,
                showtime_ids,
            } => {
                self.remove_showtimes(batch_id, showtime_ids, schedules);
            }
        }
    }
}
