use std::collections::HashMap;

use ulid::Ulid;

use crate::grid::{samples_with_step, GRID_STEP_MS};
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Grid spacing; the only resolution at which overlaps are seen.
    pub step_ms: Ms,
    /// Widens the start-time range filter backwards. Zero reproduces the
    /// plain `[min start, max start + duration]` filter.
    pub lookback_ms: Ms,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            step_ms: GRID_STEP_MS,
            lookback_ms: 0,
        }
    }
}

/// Grid sample → showtime occupying it, for one theater. Built per check.
pub struct TimeSlotIndex<'a> {
    slots: HashMap<Ms, &'a Showtime>,
    step_ms: Ms,
}

impl<'a> TimeSlotIndex<'a> {
    pub fn new(step_ms: Ms) -> Self {
        Self {
            slots: HashMap::new(),
            step_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Mark every sample of the showtime except its closing boundary, so a
    /// showing may begin exactly when another one ends.
    pub fn occupy(&mut self, showtime: &'a Showtime) {
        for t in samples_with_step(showtime.span, self.step_ms) {
            if showtime.span.contains_instant(t) {
                self.slots.entry(t).or_insert(showtime);
            }
        }
    }

    /// First occupied sample of `span`, walking in time order with both
    /// endpoints included.
    pub fn first_conflict(&self, span: Span) -> Option<&'a Showtime> {
        samples_with_step(span, self.step_ms).find_map(|t| self.slots.get(&t).copied())
    }
}

/// Existing showtimes that collide with the requested slots. At most one entry
/// per (theater, start time) pair, in theater order then start-time order.
/// Theaters without a schedule have nothing to collide with.
pub fn check_conflicts<'a>(
    request: &BatchRequest,
    config: &DetectorConfig,
    schedule_for: impl Fn(&Ulid) -> Option<&'a TheaterSchedule>,
) -> Vec<Showtime> {
    let Some(range) = request.range() else {
        return Vec::new();
    };
    let from = range.start.saturating_sub(config.lookback_ms.max(0));

    let mut conflicts = Vec::new();
    for theater_id in &request.theater_ids {
        let Some(schedule) = schedule_for(theater_id) else {
            continue;
        };
        let mut index = TimeSlotIndex::new(config.step_ms);
        for showtime in schedule.starting_within(from, range.end) {
            index.occupy(showtime);
        }
        if index.is_empty() {
            continue;
        }
        for start in &request.start_times {
            if let Some(hit) = index.first_conflict(request.slot(*start)) {
                conflicts.push(hit.clone());
            }
        }
    }
    conflicts
}

/// Two requested start times of the same batch that collide when the slots
/// are booked one after another in chronological order, earlier one first.
pub fn overlapping_start_times(request: &BatchRequest, config: &DetectorConfig) -> Option<(Ms, Ms)> {
    let mut starts = request.start_times.clone();
    starts.sort_unstable();

    let mut occupied: HashMap<Ms, Ms> = HashMap::new();
    for start in starts {
        let slot = request.slot(start);
        let earlier = samples_with_step(slot, config.step_ms).find_map(|t| occupied.get(&t).copied());
        if let Some(earlier) = earlier {
            return Some((earlier, start));
        }
        for t in samples_with_step(slot, config.step_ms).filter(|t| *t < slot.end) {
            occupied.insert(t, start);
        }
    }
    None
}
