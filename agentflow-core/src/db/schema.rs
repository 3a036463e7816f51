//! SQLite schema
//!
//! The DDL is embedded as an ordered migration list; the `user_version`
//! pragma tracks how far a given database file has been lifted.
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch so the
//! `(session_id, timestamp)` index orders events the same way the API does.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Event pipeline
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        source           TEXT NOT NULL,
        start_time       INTEGER NOT NULL,
        last_event_time  INTEGER NOT NULL,
        status           TEXT NOT NULL DEFAULT 'active',
        metadata         JSON NOT NULL DEFAULT '{}',
        user_id          TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_last_event ON sessions(last_event_time DESC);
    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);

    CREATE TABLE IF NOT EXISTS events (
        id               TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        timestamp        INTEGER NOT NULL,
        source           TEXT NOT NULL,
        category         TEXT NOT NULL,
        type             TEXT NOT NULL,
        role             TEXT,
        text             TEXT,
        tool_name        TEXT,
        tool_input       JSON,
        tool_output      JSON,
        error            TEXT,
        meta             JSON
    );

    CREATE INDEX IF NOT EXISTS idx_events_session_ts ON events(session_id, timestamp);

    -- ============================================
    -- Identity
    -- ============================================

    CREATE TABLE IF NOT EXISTS users (
        id               TEXT PRIMARY KEY,
        email            TEXT NOT NULL UNIQUE,
        name             TEXT,
        password_hash    TEXT NOT NULL,
        created_at       INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS auth_sessions (
        token_hash       TEXT PRIMARY KEY,
        user_id          TEXT NOT NULL REFERENCES users(id),
        created_at       INTEGER NOT NULL,
        expires_at       INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS api_keys (
        id               TEXT PRIMARY KEY,
        user_id          TEXT NOT NULL REFERENCES users(id),
        name             TEXT,
        key_hash         TEXT NOT NULL UNIQUE,
        created_at       INTEGER NOT NULL,
        last_used_at     INTEGER
    );

    -- ============================================
    -- Insights
    -- ============================================

    CREATE TABLE IF NOT EXISTS insights (
        id                 TEXT PRIMARY KEY,
        user_id            TEXT NOT NULL,
        repo               TEXT,
        content            TEXT NOT NULL,
        categories         JSON NOT NULL DEFAULT '[]',
        follow_up_actions  JSON NOT NULL DEFAULT '[]',
        sessions_analyzed  INTEGER NOT NULL DEFAULT 0,
        events_analyzed    INTEGER NOT NULL DEFAULT 0,
        usage              JSON,
        model              TEXT,
        phase              TEXT,
        round              INTEGER NOT NULL DEFAULT 1,
        answers_received   INTEGER NOT NULL DEFAULT 0,
        window_start       INTEGER NOT NULL,
        window_end         INTEGER NOT NULL,
        created_at         INTEGER NOT NULL,
        updated_at         INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_insights_user ON insights(user_id, created_at DESC);

    CREATE TABLE IF NOT EXISTS insight_questions (
        id               TEXT PRIMARY KEY,
        insight_id       TEXT NOT NULL REFERENCES insights(id),
        text             TEXT NOT NULL,
        answer           TEXT,
        answered_at      INTEGER,
        created_at       INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_questions_insight ON insight_questions(insight_id);

    CREATE TABLE IF NOT EXISTS insight_analysis_state (
        user_id               TEXT PRIMARY KEY,
        last_analyzed_at      INTEGER,
        last_event_timestamp  INTEGER
    );

    -- ============================================
    -- Cron jobs
    -- ============================================

    CREATE TABLE IF NOT EXISTS cron_jobs (
        id                   TEXT PRIMARY KEY,
        name                 TEXT NOT NULL,
        prompt               TEXT NOT NULL,
        schedule_text        TEXT NOT NULL,
        cron_expression      TEXT NOT NULL,
        timezone             TEXT NOT NULL DEFAULT 'UTC',
        enabled              INTEGER NOT NULL DEFAULT 1,
        notify_slack         INTEGER NOT NULL DEFAULT 0,
        last_run_at          INTEGER,
        last_run_session_id  TEXT,
        last_run_status      TEXT,
        next_run_at          INTEGER,
        total_runs           INTEGER NOT NULL DEFAULT 0,
        created_at           INTEGER NOT NULL
    );
    "#,
];

/// Bring a connection up to the latest schema.
///
/// The version a database file sits at is its `user_version` pragma; each
/// entry in `MIGRATIONS` lifts it by one. A freshly created file starts at
/// zero and replays the whole list.
pub fn migrate_to_latest(conn: &Connection) -> crate::error::Result<()> {
    let mut version = stored_version(conn)?;
    if version < SCHEMA_VERSION {
        tracing::info!(from = version, to = SCHEMA_VERSION, "migrating schema");
    }

    while let Some(step) = MIGRATIONS.get(version as usize) {
        conn.execute_batch(step)?;
        version += 1;
        conn.pragma_update(None, "user_version", version)?;
        tracing::debug!(version, "schema step applied");
    }

    Ok(())
}

/// Schema version recorded in the database file.
pub fn stored_version(conn: &Connection) -> crate::error::Result<i32> {
    let version = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}
