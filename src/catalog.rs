//! Movie and theater lookups. The scheduler only asks whether things exist and
//! what a theater's seats are; the catalog itself is owned elsewhere.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_SEATS_PER_THEATER;
use crate::model::Seat;

#[derive(Debug)]
pub enum CatalogError {
    TheaterNotFound(Ulid),
    InvalidLayout(String),
    /// The backing service or file could not be consulted.
    Unavailable(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::TheaterNotFound(id) => write!(f, "Theater with ID {id} not found"),
            CatalogError::InvalidLayout(msg) => write!(f, "invalid seat layout: {msg}"),
            CatalogError::Unavailable(msg) => write!(f, "catalog unavailable: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn movie_exists(&self, movie_id: Ulid) -> Result<bool, CatalogError>;

    async fn theater_exists(&self, theater_id: Ulid) -> Result<bool, CatalogError>;

    /// The subset of `theater_ids` that does not exist, in input order.
    async fn missing_theaters(&self, theater_ids: &[Ulid]) -> Result<Vec<Ulid>, CatalogError> {
        let mut missing = Vec::new();
        for id in theater_ids {
            if !self.theater_exists(*id).await? {
                missing.push(*id);
            }
        }
        Ok(missing)
    }

    async fn theaters_exist(&self, theater_ids: &[Ulid]) -> Result<bool, CatalogError> {
        Ok(self.missing_theaters(theater_ids).await?.is_empty())
    }

    /// Current seat layout of a theater, one entry per seat.
    async fn seat_map(&self, theater_id: Ulid) -> Result<Vec<Seat>, CatalogError>;
}

/// A block of identically sized rows, e.g. "Balcony", rows A–F, 12 seats each.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatBlock {
    pub name: String,
    pub rows: Vec<String>,
    pub seats_per_row: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TheaterLayout {
    pub blocks: Vec<SeatBlock>,
}

impl TheaterLayout {
    pub fn seat_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.rows.len() * b.seats_per_row as usize)
            .sum()
    }

    /// Seats block by block, row by row, numbered from 1.
    pub fn seats(&self) -> Vec<Seat> {
        let mut seats = Vec::with_capacity(self.seat_count());
        for block in &self.blocks {
            for row in &block.rows {
                for number in 1..=block.seats_per_row {
                    seats.push(Seat {
                        block: block.name.clone(),
                        row: row.clone(),
                        number,
                    });
                }
            }
        }
        seats
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    movies: Vec<MovieEntry>,
    #[serde(default)]
    theaters: Vec<TheaterEntry>,
}

#[derive(Debug, Deserialize)]
struct MovieEntry {
    id: Ulid,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct TheaterEntry {
    id: Ulid,
    #[serde(flatten)]
    layout: TheaterLayout,
}

/// In-process catalog, optionally seeded from a JSON file:
///
/// ```json
/// { "movies":   [{ "id": "01H...", "title": "Metropolis" }],
///   "theaters": [{ "id": "01H...", "blocks": [{ "name": "A", "rows": ["1", "2"], "seats_per_row": 10 }] }] }
/// ```
#[derive(Default)]
pub struct StaticCatalog {
    movies: DashMap<Ulid, String>,
    theaters: DashMap<Ulid, TheaterLayout>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| CatalogError::InvalidLayout(e.to_string()))?;
        let catalog = Self::new();
        for movie in file.movies {
            catalog.add_movie(movie.id, movie.title);
        }
        for theater in file.theaters {
            if theater.layout.seat_count() > MAX_SEATS_PER_THEATER {
                return Err(CatalogError::InvalidLayout(format!(
                    "theater {} has more than {MAX_SEATS_PER_THEATER} seats",
                    theater.id
                )));
            }
            catalog.add_theater(theater.id, theater.layout);
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn add_movie(&self, id: Ulid, title: impl Into<String>) {
        self.movies.insert(id, title.into());
    }

    pub fn add_theater(&self, id: Ulid, layout: TheaterLayout) {
        self.theaters.insert(id, layout);
    }

    pub fn movie_count(&self) -> usize {
        self.movies.len()
    }

    pub fn theater_count(&self) -> usize {
        self.theaters.len()
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn movie_exists(&self, movie_id: Ulid) -> Result<bool, CatalogError> {
        Ok(self.movies.contains_key(&movie_id))
    }

    async fn theater_exists(&self, theater_id: Ulid) -> Result<bool, CatalogError> {
        Ok(self.theaters.contains_key(&theater_id))
    }

    async fn seat_map(&self, theater_id: Ulid) -> Result<Vec<Seat>, CatalogError> {
        self.theaters
            .get(&theater_id)
            .map(|layout| layout.seats())
            .ok_or(CatalogError::TheaterNotFound(theater_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(rows: &[&str], per_row: u32) -> TheaterLayout {
        TheaterLayout {
            blocks: vec![SeatBlock {
                name: "Main".into(),
                rows: rows.iter().map(|r| r.to_string()).collect(),
                seats_per_row: per_row,
            }],
        }
    }

    #[test]
    fn layout_expands_row_major() {
        let seats = layout(&["A", "B"], 3).seats();
        assert_eq!(seats.len(), 6);
        assert_eq!(seats[0], Seat { block: "Main".into(), row: "A".into(), number: 1 });
        assert_eq!(seats[3], Seat { block: "Main".into(), row: "B".into(), number: 1 });
        assert_eq!(seats[5].number, 3);
    }

    #[test]
    fn parses_catalog_file() {
        let movie = Ulid::new();
        let theater = Ulid::new();
        let json = format!(
            r#"{{
                "movies": [{{ "id": "{movie}", "title": "Metropolis" }}],
                "theaters": [{{ "id": "{theater}", "blocks": [
                    {{ "name": "Stalls", "rows": ["1", "2", "3"], "seats_per_row": 10 }},
                    {{ "name": "Balcony", "rows": ["1"], "seats_per_row": 4 }}
                ] }}]
            }}"#
        );
        let catalog = StaticCatalog::from_json(&json).unwrap();
        assert_eq!(catalog.movie_count(), 1);
        assert_eq!(catalog.theater_count(), 1);
        assert_eq!(catalog.theaters.get(&theater).unwrap().seat_count(), 34);
    }

    #[test]
    fn rejects_malformed_json() {
        let err = StaticCatalog::from_json("{ not json").err().unwrap();
        assert!(matches!(err, CatalogError::InvalidLayout(_)));
    }

    #[tokio::test]
    async fn lookups() {
        let catalog = StaticCatalog::new();
        let movie = Ulid::new();
        let (t1, t2, ghost) = (Ulid::new(), Ulid::new(), Ulid::new());
        catalog.add_movie(movie, "Nosferatu");
        catalog.add_theater(t1, layout(&["A"], 2));
        catalog.add_theater(t2, TheaterLayout::default());

        assert!(catalog.movie_exists(movie).await.unwrap());
        assert!(!catalog.movie_exists(Ulid::new()).await.unwrap());
        assert!(catalog.theaters_exist(&[t1, t2]).await.unwrap());
        assert_eq!(catalog.missing_theaters(&[t1, ghost, t2]).await.unwrap(), vec![ghost]);
        assert_eq!(catalog.seat_map(t1).await.unwrap().len(), 2);
        assert!(catalog.seat_map(t2).await.unwrap().is_empty());
        assert!(matches!(
            catalog.seat_map(ghost).await,
            Err(CatalogError::TheaterNotFound(id)) if id == ghost
        ));
    }
}
