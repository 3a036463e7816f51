//! # agentflow-core
//!
//! Core library for agent-flow - a real-time observability service for
//! AI-agent coding sessions.
//!
//! This library provides:
//! - The canonical event/session data model shared by every producer
//! - Normalizers that translate per-source raw payloads into canonical events
//! - The SQLite storage layer (sessions, events, insights, cron jobs, auth)
//! - The in-process publish/subscribe event bus
//! - Credential verification for API keys and session cookies
//! - The tool-calling chat client interface used by the schedulers
//!
//! ## Architecture
//!
//! Events flow through a single pipeline:
//!
//! ```text
//! Producer -> normalize() -> Database::append() -> EventBus -> subscribers
//! ```
//!
//! Sessions are owned by the store and referenced everywhere else by string
//! id, so subscribers and schedulers never share mutable session state.

pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

pub mod analyzer;
pub mod auth;
pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod normalize;
pub mod sources;
pub mod types;
