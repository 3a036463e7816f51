//! Database repository layer
//!
//! Provides query and insert operations for all entity types. The
//! [`Database`] handle serializes writers behind a single connection; WAL
//! mode keeps readers tolerant of concurrent writes.
//!
//! `append` is the linearization point of the whole pipeline: a reader
//! either sees the event and the session-row update or neither.

use crate::error::{Error, Result};
use crate::types::*;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// Database handle (single connection guarded by a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

const SESSION_SUMMARY_SQL: &str = r#"
    SELECT s.id, s.source, s.start_time, s.last_event_time, s.status, s.metadata, s.user_id,
           (SELECT COUNT(*) FROM events e WHERE e.session_id = s.id) AS event_count,
           (SELECT e.type FROM events e WHERE e.session_id = s.id
              ORDER BY e.timestamp DESC, e.rowid DESC LIMIT 1) AS last_event_type,
           (SELECT e.text FROM events e WHERE e.session_id = s.id
              ORDER BY e.timestamp DESC, e.rowid DESC LIMIT 1) AS last_event_text
    FROM sessions s
"#;

impl Database {
    /// Open the database file, creating it (and its parent directory) on
    /// first use.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers unblocked while the ingest path writes; the
        // busy timeout covers checkpoint windows.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ephemeral in-memory database, used by the test suites.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Apply any schema migrations this build knows about.
    pub fn migrate(&self) -> Result<()> {
        super::schema::migrate_to_latest(&self.conn.lock().unwrap())
    }

    /// Direct access to the connection, for callers issuing raw SQL.
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Event pipeline
    // ============================================

    /// Append an event, upserting its session row in the same transaction.
    ///
    /// Side rules applied here, in order:
    /// - unknown session id creates the row (`active`, start = event time)
    /// - `last_event_time` never decreases; a `completed` session receiving
    ///   a new event reactivates to `active`
    /// - `category = error` raises stored status to `error`
    /// - `type = session.end` raises stored status to `completed`
    pub fn append(&self, event: &Event) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT status, last_event_time FROM sessions WHERE id = ?",
                [&event.session_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    r#"
                    INSERT INTO sessions (id, source, start_time, last_event_time, status, metadata)
                    VALUES (?1, ?2, ?3, ?3, 'active', '{}')
                    "#,
                    params![event.session_id, event.source.as_str(), event.timestamp],
                )?;
            }
            Some((status, last_event_time)) => {
                let refreshed = last_event_time.max(event.timestamp);
                let status = if status == "completed" {
                    "active".to_string()
                } else {
                    status
                };
                tx.execute(
                    "UPDATE sessions SET last_event_time = ?2, status = ?3 WHERE id = ?1",
                    params![event.session_id, refreshed, status],
                )?;
            }
        }

        if event.category == EventCategory::Error {
            tx.execute(
                "UPDATE sessions SET status = 'error' WHERE id = ?",
                [&event.session_id],
            )?;
        } else if event.event_type == "session.end" {
            tx.execute(
                "UPDATE sessions SET status = 'completed' WHERE id = ?",
                [&event.session_id],
            )?;
        }

        tx.execute(
            r#"
            INSERT INTO events (id, session_id, timestamp, source, category, type,
                                role, text, tool_name, tool_input, tool_output, error, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                event.id,
                event.session_id,
                event.timestamp,
                event.source.as_str(),
                event.category.as_str(),
                event.event_type,
                event.role.map(|r| r.as_str()),
                event.text,
                event.tool_name,
                event.tool_input.as_ref().map(|v| v.to_string()),
                event.tool_output.as_ref().map(|v| v.to_string()),
                event.error,
                event.meta.as_ref().map(|v| v.to_string()),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Get a session with derived fields applied. Returns None for unknown id.
    pub fn get_session(&self, id: &str) -> Result<Option<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} WHERE s.id = ?", SESSION_SUMMARY_SQL);
        let now = now_ms();
        conn.query_row(&sql, [id], |row| Self::row_to_summary(row, now))
            .optional()
            .map_err(Error::from)
    }

    /// Get the stored session row without derived fields.
    pub fn get_session_row(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, source, start_time, last_event_time, status, metadata, user_id
             FROM sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All sessions ordered by `last_event_time` descending, derived fields applied.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("{} ORDER BY s.last_event_time DESC", SESSION_SUMMARY_SQL);
        let now = now_ms();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| Self::row_to_summary(row, now))?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// All events for a session, ordered by `(timestamp asc, insertion order asc)`.
    pub fn get_session_events(&self, id: &str) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, timestamp, source, category, type,
                    role, text, tool_name, tool_input, tool_output, error, meta
             FROM events WHERE session_id = ? ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([id], Self::row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Shallow-merge `patch` into the session's metadata map.
    ///
    /// Top-level keys in the patch replace existing values entirely; nested
    /// objects are not merged.
    pub fn update_session_meta(&self, id: &str, patch: &Value) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row("SELECT metadata FROM sessions WHERE id = ?", [id], |r| {
                r.get(0)
            })
            .optional()?;

        let current = current.ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        let mut metadata: Value =
            serde_json::from_str(&current).unwrap_or_else(|_| serde_json::json!({}));
        if !metadata.is_object() {
            metadata = serde_json::json!({});
        }

        if let (Some(target), Some(source)) = (metadata.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        conn.execute(
            "UPDATE sessions SET metadata = ?2 WHERE id = ?1",
            params![id, metadata.to_string()],
        )?;
        Ok(())
    }

    /// Associate a session with a user (set once at first authenticated ingest).
    pub fn set_session_user(&self, id: &str, user_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET user_id = ?2 WHERE id = ?1 AND user_id IS NULL",
            params![id, user_id],
        )?;
        Ok(())
    }

    /// Delete a session and its events. Returns false if the id is unknown.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events WHERE session_id = ?", [id])?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?", [id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    /// Purge all sessions and events (events first, for the foreign key).
    pub fn clear_all(&self) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events", [])?;
        tx.execute("DELETE FROM sessions", [])?;
        tx.commit()?;
        Ok(())
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let source: String = row.get("source")?;
        let status: String = row.get("status")?;
        let metadata: String = row.get("metadata")?;
        Ok(Session {
            id: row.get("id")?,
            source: EventSource::from(source.as_str()),
            start_time: row.get("start_time")?,
            last_event_time: row.get("last_event_time")?,
            status: status.parse().unwrap_or(SessionStatus::Active),
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
            user_id: row.get("user_id")?,
        })
    }

    fn row_to_summary(row: &Row, now: i64) -> rusqlite::Result<SessionSummary> {
        let source: String = row.get("source")?;
        let status: String = row.get("status")?;
        let metadata: String = row.get("metadata")?;
        let last_event_time: i64 = row.get("last_event_time")?;
        let stored = status.parse().unwrap_or(SessionStatus::Active);
        Ok(SessionSummary {
            id: row.get("id")?,
            source: EventSource::from(source.as_str()),
            start_time: row.get("start_time")?,
            last_event_time,
            status: stored.effective(last_event_time, now),
            metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
            user_id: row.get("user_id")?,
            event_count: row.get("event_count")?,
            last_event_type: row.get("last_event_type")?,
            last_event_text: row.get("last_event_text")?,
        })
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let source: String = row.get("source")?;
        let category: String = row.get("category")?;
        let role: Option<String> = row.get("role")?;
        let tool_input: Option<String> = row.get("tool_input")?;
        let tool_output: Option<String> = row.get("tool_output")?;
        let meta: Option<String> = row.get("meta")?;
        Ok(Event {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            timestamp: row.get("timestamp")?,
            source: EventSource::from(source.as_str()),
            category: category.parse().unwrap_or(EventCategory::System),
            event_type: row.get("type")?,
            role: role.and_then(|r| r.parse().ok()),
            text: row.get("text")?,
            tool_name: row.get("tool_name")?,
            tool_input: tool_input.and_then(|s| serde_json::from_str(&s).ok()),
            tool_output: tool_output.and_then(|s| serde_json::from_str(&s).ok()),
            error: row.get("error")?,
            meta: meta.and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    // ============================================
    // Analyzer tooling
    // ============================================

    /// Users that have stored activity (distinct session owners).
    pub fn distinct_user_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT user_id FROM sessions WHERE user_id IS NOT NULL")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Count events newer than `since_ms` across a user's sessions.
    pub fn count_user_events_since(&self, user_id: &str, since_ms: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM events e
             JOIN sessions s ON s.id = e.session_id
             WHERE s.user_id = ?1 AND e.timestamp > ?2",
            params![user_id, since_ms],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Count sessions a user touched after `since_ms`.
    pub fn count_user_sessions_since(&self, user_id: &str, since_ms: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND last_event_time > ?2",
            params![user_id, since_ms],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Newest event timestamp across a user's sessions.
    pub fn latest_user_event_timestamp(&self, user_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let ts = conn.query_row(
            "SELECT MAX(e.timestamp) FROM events e
             JOIN sessions s ON s.id = e.session_id
             WHERE s.user_id = ?1",
            [user_id],
            |r| r.get(0),
        )?;
        Ok(ts)
    }

    /// Run an arbitrary query and return rows as JSON objects.
    ///
    /// Used by the analyzer's SQL tool; callers are responsible for
    /// restricting the statement to reads.
    pub fn query_json(&self, sql: &str, max_rows: usize) -> Result<Vec<Value>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if out.len() >= max_rows {
                break;
            }
            let mut obj = serde_json::Map::new();
            for (i, name) in columns.iter().enumerate() {
                obj.insert(name.clone(), value_ref_to_json(row.get_ref(i)?));
            }
            out.push(Value::Object(obj));
        }
        Ok(out)
    }

    /// DDL of the user-visible tables, for the analyzer's schema tool.
    pub fn schema_ddl(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT sql FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
             ORDER BY name",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        let mut ddl = Vec::new();
        for row in rows {
            ddl.push(row?);
        }
        Ok(ddl)
    }

    // ============================================
    // Insight state
    // ============================================

    pub fn analysis_state(&self, user_id: &str) -> Result<AnalysisState> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT last_analyzed_at, last_event_timestamp
                 FROM insight_analysis_state WHERE user_id = ?",
                [user_id],
                |r| {
                    Ok(AnalysisState {
                        last_analyzed_at: r.get(0)?,
                        last_event_timestamp: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub fn set_analysis_state(&self, user_id: &str, state: &AnalysisState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO insight_analysis_state (user_id, last_analyzed_at, last_event_timestamp)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET
                last_analyzed_at = excluded.last_analyzed_at,
                last_event_timestamp = excluded.last_event_timestamp
            "#,
            params![user_id, state.last_analyzed_at, state.last_event_timestamp],
        )?;
        Ok(())
    }

    pub fn insert_insight(&self, insight: &Insight) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO insights (id, user_id, repo, content, categories, follow_up_actions,
                                  sessions_analyzed, events_analyzed, usage, model, phase,
                                  round, answers_received, window_start, window_end,
                                  created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                insight.id,
                insight.user_id,
                insight.repo,
                insight.content,
                serde_json::to_string(&insight.categories)?,
                serde_json::to_string(&insight.follow_up_actions)?,
                insight.sessions_analyzed,
                insight.events_analyzed,
                insight.usage.as_ref().map(|v| v.to_string()),
                insight.model,
                insight.phase.map(|p| p.as_str()),
                insight.round,
                insight.answers_received,
                insight.window_start,
                insight.window_end,
                insight.created_at,
                insight.updated_at,
            ],
        )?;
        Ok(())
    }

    /// In-place refinement update; everything except identity and window.
    pub fn update_insight(&self, insight: &Insight) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE insights SET content = ?2, categories = ?3, follow_up_actions = ?4,
                                usage = ?5, model = ?6, phase = ?7, round = ?8,
                                answers_received = ?9, updated_at = ?10
            WHERE id = ?1
            "#,
            params![
                insight.id,
                insight.content,
                serde_json::to_string(&insight.categories)?,
                serde_json::to_string(&insight.follow_up_actions)?,
                insight.usage.as_ref().map(|v| v.to_string()),
                insight.model,
                insight.phase.map(|p| p.as_str()),
                insight.round,
                insight.answers_received,
                insight.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_insight(&self, id: &str) -> Result<Option<Insight>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM insights WHERE id = ?",
            [id],
            Self::row_to_insight,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn list_insights(&self, user_id: &str) -> Result<Vec<Insight>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM insights WHERE user_id = ? ORDER BY created_at DESC")?;
        let rows = stmt.query_map([user_id], Self::row_to_insight)?;
        let mut insights = Vec::new();
        for row in rows {
            insights.push(row?);
        }
        Ok(insights)
    }

    fn row_to_insight(row: &Row) -> rusqlite::Result<Insight> {
        let categories: String = row.get("categories")?;
        let actions: String = row.get("follow_up_actions")?;
        let usage: Option<String> = row.get("usage")?;
        let phase: Option<String> = row.get("phase")?;
        Ok(Insight {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            repo: row.get("repo")?,
            content: row.get("content")?,
            categories: serde_json::from_str(&categories).unwrap_or_default(),
            follow_up_actions: serde_json::from_str(&actions).unwrap_or_default(),
            sessions_analyzed: row.get("sessions_analyzed")?,
            events_analyzed: row.get("events_analyzed")?,
            usage: usage.and_then(|s| serde_json::from_str(&s).ok()),
            model: row.get("model")?,
            phase: phase.and_then(|p| p.parse().ok()),
            round: row.get("round")?,
            answers_received: row.get("answers_received")?,
            window_start: row.get("window_start")?,
            window_end: row.get("window_end")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn insert_question(&self, question: &InsightQuestion) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO insight_questions (id, insight_id, text, answer, answered_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                question.id,
                question.insight_id,
                question.text,
                question.answer,
                question.answered_at,
                question.created_at,
            ],
        )?;
        Ok(())
    }

    /// Record an answer; returns the updated question, or None for unknown id.
    pub fn answer_question(&self, id: &str, answer: &str) -> Result<Option<InsightQuestion>> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE insight_questions SET answer = ?2, answered_at = ?3 WHERE id = ?1",
            params![id, answer, now_ms()],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT id, insight_id, text, answer, answered_at, created_at
             FROM insight_questions WHERE id = ?",
            [id],
            Self::row_to_question,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn questions_for_insight(&self, insight_id: &str) -> Result<Vec<InsightQuestion>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, insight_id, text, answer, answered_at, created_at
             FROM insight_questions WHERE insight_id = ? ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([insight_id], Self::row_to_question)?;
        let mut questions = Vec::new();
        for row in rows {
            questions.push(row?);
        }
        Ok(questions)
    }

    fn row_to_question(row: &Row) -> rusqlite::Result<InsightQuestion> {
        Ok(InsightQuestion {
            id: row.get("id")?,
            insight_id: row.get("insight_id")?,
            text: row.get("text")?,
            answer: row.get("answer")?,
            answered_at: row.get("answered_at")?,
            created_at: row.get("created_at")?,
        })
    }

    // ============================================
    // Cron jobs
    // ============================================

    pub fn insert_cron_job(&self, job: &CronJob) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO cron_jobs (id, name, prompt, schedule_text, cron_expression, timezone,
                                   enabled, notify_slack, last_run_at, last_run_session_id,
                                   last_run_status, next_run_at, total_runs, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
            params![
                job.id,
                job.name,
                job.prompt,
                job.schedule_text,
                job.cron_expression,
                job.timezone,
                job.enabled,
                job.notify_slack,
                job.last_run_at,
                job.last_run_session_id,
                job.last_run_status.map(|s| s.as_str()),
                job.next_run_at,
                job.total_runs,
                job.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM cron_jobs ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], Self::row_to_cron_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn list_enabled_cron_jobs(&self) -> Result<Vec<CronJob>> {
        Ok(self
            .list_cron_jobs()?
            .into_iter()
            .filter(|j| j.enabled)
            .collect())
    }

    pub fn get_cron_job(&self, id: &str) -> Result<Option<CronJob>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM cron_jobs WHERE id = ?",
            [id],
            Self::row_to_cron_job,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Persist the outcome of a run and bump `total_runs`.
    pub fn record_cron_run(
        &self,
        id: &str,
        last_run_at: i64,
        session_id: &str,
        status: CronRunStatus,
        next_run_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE cron_jobs SET last_run_at = ?2, last_run_session_id = ?3,
                                 last_run_status = ?4, next_run_at = ?5,
                                 total_runs = total_runs + 1
            WHERE id = ?1
            "#,
            params![id, last_run_at, session_id, status.as_str(), next_run_at],
        )?;
        Ok(())
    }

    pub fn set_cron_next_run(&self, id: &str, next_run_at: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cron_jobs SET next_run_at = ?2 WHERE id = ?1",
            params![id, next_run_at],
        )?;
        Ok(())
    }

    pub fn set_cron_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cron_jobs SET enabled = ?2 WHERE id = ?1",
            params![id, enabled],
        )?;
        Ok(())
    }

    fn row_to_cron_job(row: &Row) -> rusqlite::Result<CronJob> {
        let status: Option<String> = row.get("last_run_status")?;
        Ok(CronJob {
            id: row.get("id")?,
            name: row.get("name")?,
            prompt: row.get("prompt")?,
            schedule_text: row.get("schedule_text")?,
            cron_expression: row.get("cron_expression")?,
            timezone: row.get("timezone")?,
            enabled: row.get("enabled")?,
            notify_slack: row.get("notify_slack")?,
            last_run_at: row.get("last_run_at")?,
            last_run_session_id: row.get("last_run_session_id")?,
            last_run_status: status.and_then(|s| s.parse().ok()),
            next_run_at: row.get("next_run_at")?,
            total_runs: row.get("total_runs")?,
            created_at: row.get("created_at")?,
        })
    }

    // ============================================
    // Identity
    // ============================================

    pub fn insert_user(&self, user: &User, password_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (id, email, name, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user.id, user.email, user.name, password_hash, user.created_at],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, name, created_at FROM users WHERE id = ?",
            [id],
            Self::row_to_user,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Returns the user and their stored password hash.
    pub fn get_user_by_email(&self, email: &str) -> Result<Option<(User, String)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, name, created_at, password_hash FROM users WHERE email = ?",
            [email],
            |row| {
                let user = Self::row_to_user(row)?;
                let hash: String = row.get("password_hash")?;
                Ok((user, hash))
            },
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn count_users(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(count)
    }

    fn row_to_user(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get("id")?,
            email: row.get("email")?,
            name: row.get("name")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn insert_auth_session(
        &self,
        token_hash: &str,
        user_id: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO auth_sessions (token_hash, user_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![token_hash, user_id, created_at, expires_at],
        )?;
        Ok(())
    }

    /// Returns `(user_id, expires_at)` for a stored session token digest.
    pub fn get_auth_session(&self, token_hash: &str) -> Result<Option<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, expires_at FROM auth_sessions WHERE token_hash = ?",
            [token_hash],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn delete_auth_session(&self, token_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM auth_sessions WHERE token_hash = ?", [token_hash])?;
        Ok(())
    }

    pub fn insert_api_key(&self, key: &ApiKey, key_hash: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_keys (id, user_id, name, key_hash, created_at, last_used_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                key.id,
                key.user_id,
                key.name,
                key_hash,
                key.created_at,
                key.last_used_at
            ],
        )?;
        Ok(())
    }

    /// Resolve an API-key digest to its owner, touching `last_used_at`.
    pub fn find_api_key_user(&self, key_hash: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let user_id: Option<String> = conn
            .query_row(
                "SELECT user_id FROM api_keys WHERE key_hash = ?",
                [key_hash],
                |r| r.get(0),
            )
            .optional()?;
        if user_id.is_some() {
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE key_hash = ?1",
                params![key_hash, now_ms()],
            )?;
        }
        Ok(user_id)
    }
}

fn value_ref_to_json(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(hex::encode(b)),
    }
}
