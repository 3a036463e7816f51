//! Core domain types for agent-flow
//!
//! These types form the canonical event model that normalizes activity
//! pushed by every supported producer.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | A single producer-issued conversational run, identified by a producer-chosen opaque id |
//! | **Event** | A single atomic observation inside a Session; immutable once appended |
//! | **Source** | The producer that emitted an event (claude-code, codex, opencode, cron, sandbox) |
//! | **Effective status** | The status readers see: stored status plus the stale-timeout rule |
//! | **Insight** | A persisted analysis artifact over a (user, time window) pair |
//! | **Cron job** | A user-defined scheduled prompt that executes as a synthetic Session |
//!
//! Timestamps are milliseconds since the Unix epoch throughout. Events for a
//! session are ordered by `(timestamp, insertion order)`; producers are not
//! required to emit monotonic timestamps.

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Milliseconds of inactivity after which a stored `active` session reads as
/// `completed` without mutating stored state.
pub const STALE_AFTER_MS: i64 = 120_000;

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ============================================
// Event Source
// ============================================

/// Producer tag attached to every event.
///
/// The set is open-ended: unknown producers round-trip through
/// [`EventSource::Other`] so the pipeline never rejects a payload on the
/// source tag alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventSource {
    ClaudeCode,
    Codex,
    Opencode,
    Cron,
    Sandbox,
    Other(String),
}

impl EventSource {
    pub fn as_str(&self) -> &str {
        match self {
            EventSource::ClaudeCode => "claude-code",
            EventSource::Codex => "codex",
            EventSource::Opencode => "opencode",
            EventSource::Cron => "cron",
            EventSource::Sandbox => "sandbox",
            EventSource::Other(s) => s,
        }
    }
}

impl From<&str> for EventSource {
    fn from(s: &str) -> Self {
        match s {
            "claude-code" => EventSource::ClaudeCode,
            "codex" => EventSource::Codex,
            "opencode" => EventSource::Opencode,
            "cron" => EventSource::Cron,
            "sandbox" => EventSource::Sandbox,
            other => EventSource::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventSource::from(s.as_str()))
    }
}

// ============================================
// Event Category / Role
// ============================================

/// Coarse classification of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Session,
    Message,
    Tool,
    Error,
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Session => "session",
            EventCategory::Message => "message",
            EventCategory::Tool => "tool",
            EventCategory::Error => "error",
            EventCategory::System => "system",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "session" => Ok(EventCategory::Session),
            "message" => Ok(EventCategory::Message),
            "tool" => Ok(EventCategory::Tool),
            "error" => Ok(EventCategory::Error),
            "system" => Ok(EventCategory::System),
            _ => Err(format!("unknown event category: {}", s)),
        }
    }
}

/// Conversational role on message events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

// ============================================
// Event
// ============================================

/// A single normalized observation inside a session.
///
/// Created by the normalizer (or synthesized by the schedulers), appended to
/// the store exactly once, and never mutated afterwards. All producers share
/// this schema; fields a dialect does not populate are `null` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Opaque unique identifier (UUID v4, assigned at normalization time)
    pub id: String,
    /// Session this event belongs to
    pub session_id: String,
    /// Milliseconds since epoch; ties are broken by insertion order
    pub timestamp: i64,
    /// Producer tag
    pub source: EventSource,
    /// Coarse classification
    pub category: EventCategory,
    /// Lowercase dot-separated verb (`session.start`, `tool.end`, ...)
    #[serde(rename = "type")]
    pub event_type: String,
    /// Conversational role, for message events
    #[serde(default)]
    pub role: Option<Role>,
    /// Free text (prompt, response, ...)
    #[serde(default)]
    pub text: Option<String>,
    /// Name of the tool, for tool events
    #[serde(default)]
    pub tool_name: Option<String>,
    /// Structured tool input, copied through from the producer
    #[serde(default)]
    pub tool_input: Option<Value>,
    /// Structured tool output, truncated to the serialized size limit
    #[serde(default)]
    pub tool_output: Option<Value>,
    /// Error description, for error events
    #[serde(default)]
    pub error: Option<String>,
    /// Free-form mapping of dialect-specific extras
    #[serde(default)]
    pub meta: Option<Value>,
}

// ============================================
// Session
// ============================================

/// Stored status of a session.
///
/// Readers never see this directly: [`SessionStatus::effective`] applies the
/// stale-timeout rule first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
    Archived,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Archived => "archived",
        }
    }

    /// Apply the stale-timeout rule: a stored `active` session whose last
    /// event is older than [`STALE_AFTER_MS`] reads as `completed`.
    pub fn effective(self, last_event_time: i64, now: i64) -> SessionStatus {
        if self == SessionStatus::Active && now - last_event_time > STALE_AFTER_MS {
            SessionStatus::Completed
        } else {
            self
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "archived" => Ok(SessionStatus::Archived),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// A session row as stored: producer-supplied id plus lifecycle fields.
///
/// Derived fields (event count, last event, effective status) are computed
/// at read time and live on [`SessionSummary`]; they are never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub source: EventSource,
    /// First-event timestamp (ms)
    pub start_time: i64,
    /// Monotonically non-decreasing across inserts (ms)
    pub last_event_time: i64,
    pub status: SessionStatus,
    /// Accumulates merged user/git info from ingest requests
    pub metadata: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A session with derived fields applied, as returned to readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub source: EventSource,
    pub start_time: i64,
    pub last_event_time: i64,
    /// Effective status (stale-timeout rule already applied)
    pub status: SessionStatus,
    pub metadata: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    pub event_count: i64,
    #[serde(default)]
    pub last_event_type: Option<String>,
    #[serde(default)]
    pub last_event_text: Option<String>,
}

// ============================================
// Insights
// ============================================

/// Phase of an insight's question/answer refinement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightPhase {
    #[serde(rename = "preliminary")]
    Preliminary,
    #[serde(rename = "refined")]
    Refined,
    #[serde(rename = "final-no-answers")]
    FinalNoAnswers,
}

impl InsightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightPhase::Preliminary => "preliminary",
            InsightPhase::Refined => "refined",
            InsightPhase::FinalNoAnswers => "final-no-answers",
        }
    }
}

impl std::str::FromStr for InsightPhase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "preliminary" => Ok(InsightPhase::Preliminary),
            "refined" => Ok(InsightPhase::Refined),
            "final-no-answers" => Ok(InsightPhase::FinalNoAnswers),
            _ => Err(format!("unknown insight phase: {}", s)),
        }
    }
}

/// Priority of a follow-up action suggested by the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    Medium,
    High,
}

/// Category of a follow-up action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    Tooling,
    Workflow,
    Knowledge,
    Other,
}

/// A concrete follow-up the analyzer recommends to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpAction {
    pub description: String,
    pub priority: ActionPriority,
    pub category: ActionCategory,
}

/// One analysis artifact per (user, time window).
///
/// Immutable except for in-place refinement after user answers arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    pub id: String,
    pub user_id: String,
    /// Optional repository scope
    #[serde(default)]
    pub repo: Option<String>,
    /// Markdown body
    pub content: String,
    pub categories: Vec<String>,
    pub follow_up_actions: Vec<FollowUpAction>,
    pub sessions_analyzed: i64,
    pub events_analyzed: i64,
    /// Token-usage meta from the analyzer, when reported
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    /// Absent when the analyzer asked no questions
    #[serde(default)]
    pub phase: Option<InsightPhase>,
    /// Refinement round, 1-based; capped at [`MAX_INSIGHT_ROUNDS`]
    pub round: i64,
    pub answers_received: i64,
    pub window_start: i64,
    pub window_end: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Maximum number of preliminary refinement rounds for one insight.
pub const MAX_INSIGHT_ROUNDS: i64 = 3;

/// A follow-up question posted to the user's question channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightQuestion {
    pub id: String,
    pub insight_id: String,
    pub text: String,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub answered_at: Option<i64>,
    pub created_at: i64,
}

/// Per-user cursor for the periodic insight analyzer.
#[derive(Debug, Clone, Default)]
pub struct AnalysisState {
    pub last_analyzed_at: Option<i64>,
    pub last_event_timestamp: Option<i64>,
}

// ============================================
// Cron Jobs
// ============================================

/// Outcome of the most recent cron job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronRunStatus {
    Success,
    Failed,
}

impl CronRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronRunStatus::Success => "success",
            CronRunStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for CronRunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(CronRunStatus::Success),
            "failed" => Ok(CronRunStatus::Failed),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

/// A user-defined scheduled prompt.
///
/// `cron_expression` is the canonical schedule; `schedule_text` is the human
/// echo kept only for display and never parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub prompt: String,
    pub schedule_text: String,
    pub cron_expression: String,
    pub timezone: String,
    pub enabled: bool,
    pub notify_slack: bool,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub last_run_session_id: Option<String>,
    #[serde(default)]
    pub last_run_status: Option<CronRunStatus>,
    #[serde(default)]
    pub next_run_at: Option<i64>,
    pub total_runs: i64,
    pub created_at: i64,
}

// ============================================
// Auth
// ============================================

/// A registered user (the principal credentials resolve to).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: i64,
}

/// Metadata for an issued API key. The key itself is only shown once at
/// creation; the store keeps a digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: Option<i64>,
}
