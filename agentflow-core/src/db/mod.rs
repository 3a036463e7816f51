//! Database storage layer
//!
//! SQLite-backed storage for sessions, events, insights, cron jobs and
//! credentials. See [`repo::Database`] for the operations.

pub mod repo;
pub mod schema;

pub use repo::Database;
