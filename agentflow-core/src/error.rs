//! Error types for agentflow-core

use thiserror::Error;

/// Main error type for the agentflow-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or invalid credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// External analyzer error
    #[error("analyzer error: {0}")]
    Analyzer(String),

    /// Scheduled job error
    #[error("cron error: {0}")]
    Cron(String),
}

/// Result type alias for agentflow-core
pub type Result<T> = std::result::Result<T, Error>;
