pub mod catalog;
pub mod config;
pub mod engine;
pub mod grid;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod scheduler;
pub mod wal;
pub mod wire;
