use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use ulid::Ulid;

use crate::catalog::{Catalog, CatalogError};
use crate::engine::{Engine, EngineError};
use crate::limits::MAX_SEATS_PER_THEATER;
use crate::model::*;

#[derive(Debug)]
pub enum FanoutError {
    SeatMap { theater_id: Ulid, source: CatalogError },
    TooManySeats { theater_id: Ulid, seats: usize },
    Engine(EngineError),
}

impl std::fmt::Display for FanoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanoutError::SeatMap { theater_id, source } => {
                write!(f, "seat map for theater {theater_id} unavailable: {source}")
            }
            FanoutError::TooManySeats { theater_id, seats } => write!(
                f,
                "theater {theater_id} has {seats} seats, limit is {MAX_SEATS_PER_THEATER}"
            ),
            FanoutError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FanoutError {}

impl From<EngineError> for FanoutError {
    fn from(e: EngineError) -> Self {
        FanoutError::Engine(e)
    }
}

/// Expands showtimes into one open ticket per seat of their theater.
pub struct TicketFanout {
    catalog: Arc<dyn Catalog>,
}

impl TicketFanout {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Resolve seat maps (once per theater per call) and build the tickets
    /// without writing anything. Any lookup failure fails the whole call.
    pub async fn plan(&self, showtimes: &[Showtime]) -> Result<Vec<Ticket>, FanoutError> {
        let mut seat_maps: HashMap<Ulid, Vec<Seat>> = HashMap::new();
        for showtime in showtimes {
            let theater_id = showtime.theater_id;
            if seat_maps.contains_key(&theater_id) {
                continue;
            }
            let seats = self
                .catalog
                .seat_map(theater_id)
                .await
                .map_err(|source| FanoutError::SeatMap { theater_id, source })?;
            if seats.len() > MAX_SEATS_PER_THEATER {
                return Err(FanoutError::TooManySeats {
                    theater_id,
                    seats: seats.len(),
                });
            }
            seat_maps.insert(theater_id, seats);
        }

        let mut tickets = Vec::new();
        for showtime in showtimes {
            if let Some(seats) = seat_maps.get(&showtime.theater_id) {
                tickets.extend(seats.iter().cloned().map(|seat| Ticket::open(showtime, seat)));
            }
        }
        debug!(
            "planned {} tickets for {} showtimes across {} theaters",
            tickets.len(),
            showtimes.len(),
            seat_maps.len()
        );
        Ok(tickets)
    }

    /// Plan, then persist every ticket in a single record.
    pub async fn create_for_showtimes(
        &self,
        engine: &Engine,
        showtimes: &[Showtime],
    ) -> Result<Vec<Ticket>, FanoutError> {
        let tickets = self.plan(showtimes).await?;
        Ok(engine.create_tickets(tickets).await?)
    }
}
