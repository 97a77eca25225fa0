use ulid::Ulid;

use crate::model::*;

use super::{BatchRecord, Engine};

impl Engine {
    pub fn batch(&self, batch_id: &Ulid) -> Option<BatchRecord> {
        self.store.batch(batch_id)
    }

    pub fn batch_state(&self, batch_id: &Ulid) -> Option<BatchState> {
        self.store.batch(batch_id).map(|r| r.state)
    }

    pub fn batch_count(&self) -> usize {
        self.store.batch_count()
    }

    /// Batches that were requested but never settled, oldest first.
    pub fn unsettled_batches(&self) -> Vec<Ulid> {
        self.store.unsettled_batches()
    }

    /// Raw store view: every showtime currently tagged with the batch, in
    /// creation order, whatever the batch state.
    pub fn showtimes_for_batch(&self, batch_id: &Ulid) -> Vec<Showtime> {
        self.store.showtimes_for_batch(batch_id)
    }

    pub fn showtimes_for_movie(&self, movie_id: &Ulid) -> Vec<Showtime> {
        self.store.showtimes_for_movie(movie_id)
    }

    pub fn showtime(&self, showtime_id: &Ulid) -> Option<Showtime> {
        self.store.showtime(showtime_id)
    }

    pub fn tickets_for_showtime(&self, showtime_id: &Ulid) -> Vec<Ticket> {
        self.store.tickets_for_showtime(showtime_id)
    }

    pub fn tickets_for_batch(&self, batch_id: &Ulid) -> Vec<Ticket> {
        self.store
            .showtime_ids_for_batch(batch_id)
            .iter()
            .flat_map(|id| self.store.tickets_for_showtime(id))
            .collect()
    }

    /// Showtimes of a theater starting in `[from, to]`, under a read lock.
    pub async fn showtimes_starting_within(&self, theater_id: Ulid, from: Ms, to: Ms) -> Vec<Showtime> {
        let Some(schedule) = self.schedules.get(&theater_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = schedule.read().await;
        guard.starting_within(from, to).cloned().collect()
    }
}
