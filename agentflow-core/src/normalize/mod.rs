//! Normalization of raw producer payloads into canonical events
//!
//! `normalize` is a pure function: no I/O, no state. Each source's dialect
//! is a table of `(tag, builder)` rules scanned top to bottom, so adding a
//! producer or a hook never touches the others. Normalization is total:
//! any payload no rule matches becomes a `system` event carrying the raw
//! payload under `meta.rawEvent`, so no producer message is ever rejected.

mod claude;
mod codex;
mod opencode;

use crate::types::{now_ms, Event, EventCategory, EventSource, Role};
use serde_json::Value;
use uuid::Uuid;

/// Serialized size limit for `toolOutput` (characters).
pub const TOOL_OUTPUT_LIMIT: usize = 10_000;

/// Translate a raw producer payload into a canonical [`Event`].
///
/// The timestamp is taken from the payload's `timestamp` field when numeric,
/// otherwise "now". Sources without a dialect table fall straight through to
/// the `system` catch-all.
pub fn normalize(source: &EventSource, session_id: &str, raw: &Value) -> Event {
    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_else(now_ms);
    let ctx = Ctx {
        source: source.clone(),
        session_id,
        raw,
        timestamp,
    };

    match source {
        EventSource::ClaudeCode => claude::normalize(&ctx),
        EventSource::Codex => codex::normalize(&ctx),
        EventSource::Opencode => opencode::normalize(&ctx),
        _ => raw_fallback(&ctx, None),
    }
}

/// Inputs shared by every dialect builder.
pub(crate) struct Ctx<'a> {
    pub source: EventSource,
    pub session_id: &'a str,
    pub raw: &'a Value,
    pub timestamp: i64,
}

impl Ctx<'_> {
    /// Start an event with the shared fields filled in and everything else null.
    pub(crate) fn event(&self, category: EventCategory, event_type: &str) -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.to_string(),
            timestamp: self.timestamp,
            source: self.source.clone(),
            category,
            event_type: event_type.to_string(),
            role: None,
            text: None,
            tool_name: None,
            tool_input: None,
            tool_output: None,
            error: None,
            meta: None,
        }
    }

    /// First non-null string among the named fields of the raw payload.
    pub(crate) fn first_str(&self, fields: &[&str]) -> Option<String> {
        fields
            .iter()
            .find_map(|f| self.raw.get(*f).and_then(Value::as_str))
            .map(|s| s.to_string())
    }
}

/// Catch-all for unrecognized payloads: `system` event with the raw payload
/// preserved under `meta.rawEvent`.
pub(crate) fn raw_fallback(ctx: &Ctx, raw_type: Option<&str>) -> Event {
    let event_type = match raw_type {
        Some(t) if !t.is_empty() => t,
        _ => "unknown",
    };
    let mut event = ctx.event(EventCategory::System, event_type);
    event.meta = Some(serde_json::json!({ "rawEvent": ctx.raw.clone() }));
    event
}

/// Message events share a role and an optional text body.
pub(crate) fn message_event(ctx: &Ctx, event_type: &str, role: Role, text: Option<String>) -> Event {
    let mut event = ctx.event(EventCategory::Message, event_type);
    event.role = Some(role);
    event.text = text;
    event
}

/// Apply the serialized size limit to a tool output value.
///
/// Strings are measured on their raw contents; everything else on its JSON
/// serialization. Oversize values are replaced by a 10 000-char prefix plus
/// an explicit truncation marker preserving the original length.
pub fn truncate_tool_output(value: &Value) -> Value {
    let serialized = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let total = serialized.chars().count();
    if total <= TOOL_OUTPUT_LIMIT {
        return value.clone();
    }

    let prefix: String = serialized.chars().take(TOOL_OUTPUT_LIMIT).collect();
    Value::String(format!(
        "{}... [truncated, {} chars total]",
        prefix, total
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation_under_limit_is_identity() {
        let v = serde_json::json!("short output");
        assert_eq!(truncate_tool_output(&v), v);

        let v = serde_json::json!({"stdout": "ok"});
        assert_eq!(truncate_tool_output(&v), v);
    }

    #[test]
    fn test_truncation_marker() {
        let long = "x".repeat(15_000);
        let truncated = truncate_tool_output(&Value::String(long));
        let s = truncated.as_str().unwrap();
        assert!(s.starts_with(&"x".repeat(TOOL_OUTPUT_LIMIT)));
        assert!(s.ends_with("... [truncated, 15000 chars total]"));
        assert_eq!(
            s.len(),
            TOOL_OUTPUT_LIMIT + "... [truncated, 15000 chars total]".len()
        );
    }

    #[test]
    fn test_truncation_of_structured_output() {
        let long = serde_json::json!({"stdout": "y".repeat(20_000)});
        let truncated = truncate_tool_output(&long);
        let s = truncated.as_str().unwrap();
        assert!(s.contains("[truncated,"));
        assert!(s.chars().count() <= TOOL_OUTPUT_LIMIT + 40);
    }

    #[test]
    fn test_timestamp_from_payload() {
        let raw = serde_json::json!({"timestamp": 1700000000000i64, "hook_event_name": "SessionStart"});
        let event = normalize(&EventSource::ClaudeCode, "s1", &raw);
        assert_eq!(event.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_timestamp_defaults_to_now() {
        let before = now_ms();
        let event = normalize(&EventSource::ClaudeCode, "s1", &serde_json::json!({}));
        assert!(event.timestamp >= before);
    }

    #[test]
    fn test_unknown_source_falls_back_to_system() {
        let raw = serde_json::json!({"anything": true});
        let event = normalize(&EventSource::Other("aider".into()), "s1", &raw);
        assert_eq!(event.category, EventCategory::System);
        assert_eq!(event.meta.as_ref().unwrap()["rawEvent"]["anything"], true);
    }
}
