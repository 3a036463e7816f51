//! Claude Code hook dialect
//!
//! Payloads arrive from the hook adapter script, one POST per hook firing,
//! dispatched on `hook_event_name`. The rule table below is scanned top to
//! bottom; anything unmatched becomes a `system` event.

use super::{message_event, raw_fallback, truncate_tool_output, Ctx};
use crate::types::{Event, EventCategory, Role};
use serde_json::Value;

type BuildFn = fn(&Ctx) -> Event;

/// `hook_event_name` -> builder, first match wins.
const HOOK_RULES: &[(&str, BuildFn)] = &[
    ("SessionStart", session_start),
    ("UserPromptSubmit", user_prompt),
    ("PreToolUse", tool_start),
    ("PostToolUse", tool_end),
    ("Stop", stop),
    ("SessionEnd", session_end),
    ("Error", error),
];

pub(crate) fn normalize(ctx: &Ctx) -> Event {
    let hook = ctx
        .raw
        .get("hook_event_name")
        .and_then(Value::as_str)
        .unwrap_or("");

    for (name, build) in HOOK_RULES {
        if *name == hook {
            return build(ctx);
        }
    }
    raw_fallback(ctx, Some(hook))
}

fn session_start(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.start")
}

fn user_prompt(ctx: &Ctx) -> Event {
    let text = ctx.first_str(&["user_message", "message", "text", "prompt"]);
    message_event(ctx, "message.user", Role::User, text)
}

fn tool_start(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Tool, "tool.start");
    event.tool_name = ctx.first_str(&["tool_name"]);
    event.tool_input = ctx.raw.get("tool_input").cloned();
    event
}

fn tool_end(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Tool, "tool.end");
    event.tool_name = ctx.first_str(&["tool_name"]);
    event.tool_output = ctx
        .raw
        .get("tool_response")
        .or_else(|| ctx.raw.get("tool_output"))
        .map(truncate_tool_output);
    event
}

fn stop(ctx: &Ctx) -> Event {
    let text = ctx.first_str(&["result", "response"]);
    let mut event = message_event(ctx, "message.assistant", Role::Assistant, text);
    if let Some(reason) = ctx.raw.get("stop_reason") {
        event.meta = Some(serde_json::json!({ "stop_reason": reason.clone() }));
    }
    event
}

fn session_end(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.end")
}

fn error(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Error, "error");
    event.error = ctx.first_str(&["error", "message"]);
    event
}

#[cfg(test)]
mod tests {
    use crate::normalize::normalize;
    use crate::types::{EventCategory, EventSource, Role};
    use serde_json::json;

    fn run(raw: serde_json::Value) -> crate::types::Event {
        normalize(&EventSource::ClaudeCode, "S1", &raw)
    }

    #[test]
    fn test_full_turn_mapping() {
        // The five hooks of a complete turn, in producer order
        let events = vec![
            run(json!({"hook_event_name": "SessionStart", "session_id": "S1"})),
            run(json!({"hook_event_name": "UserPromptSubmit", "session_id": "S1", "message": "fix bug"})),
            run(json!({"hook_event_name": "PreToolUse", "session_id": "S1",
                       "tool_name": "Read", "tool_input": {"file_path": "a.ts"}})),
            run(json!({"hook_event_name": "PostToolUse", "session_id": "S1",
                       "tool_name": "Read", "tool_output": "ok"})),
            run(json!({"hook_event_name": "Stop", "session_id": "S1"})),
        ];

        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "session.start",
                "message.user",
                "tool.start",
                "tool.end",
                "message.assistant"
            ]
        );
        assert_eq!(events[1].role, Some(Role::User));
        assert_eq!(events[1].text.as_deref(), Some("fix bug"));
        assert_eq!(events[2].tool_name.as_deref(), Some("Read"));
        assert_eq!(events[2].tool_input.as_ref().unwrap()["file_path"], "a.ts");
        assert_eq!(events[3].tool_output, Some(json!("ok")));
        assert_eq!(events[4].role, Some(Role::Assistant));
    }

    #[test]
    fn test_prompt_text_fallback_order() {
        let event = run(json!({"hook_event_name": "UserPromptSubmit",
                               "user_message": "first", "message": "second"}));
        assert_eq!(event.text.as_deref(), Some("first"));

        let event = run(json!({"hook_event_name": "UserPromptSubmit", "prompt": "last resort"}));
        assert_eq!(event.text.as_deref(), Some("last resort"));

        let event = run(json!({"hook_event_name": "UserPromptSubmit"}));
        assert!(event.text.is_none());
    }

    #[test]
    fn test_tool_response_preferred_over_tool_output() {
        let event = run(json!({"hook_event_name": "PostToolUse",
                               "tool_name": "Bash",
                               "tool_response": {"stdout": "a"},
                               "tool_output": "b"}));
        assert_eq!(event.tool_output, Some(json!({"stdout": "a"})));
    }

    #[test]
    fn test_stop_preserves_stop_reason() {
        let event = run(json!({"hook_event_name": "Stop", "result": "done", "stop_reason": "end_turn"}));
        assert_eq!(event.text.as_deref(), Some("done"));
        assert_eq!(event.meta.as_ref().unwrap()["stop_reason"], "end_turn");

        let event = run(json!({"hook_event_name": "Stop", "response": "alt"}));
        assert_eq!(event.text.as_deref(), Some("alt"));
        assert!(event.meta.is_none());
    }

    #[test]
    fn test_session_end_and_error() {
        let event = run(json!({"hook_event_name": "SessionEnd"}));
        assert_eq!(event.category, EventCategory::Session);
        assert_eq!(event.event_type, "session.end");

        let event = run(json!({"hook_event_name": "Error", "error": "boom"}));
        assert_eq!(event.category, EventCategory::Error);
        assert_eq!(event.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_unknown_hook_becomes_system() {
        let event = run(json!({"hook_event_name": "Notification", "payload": 1}));
        assert_eq!(event.category, EventCategory::System);
        assert_eq!(event.event_type, "Notification");
        assert_eq!(
            event.meta.as_ref().unwrap()["rawEvent"]["hook_event_name"],
            "Notification"
        );
    }

    #[test]
    fn test_oversize_tool_output_truncated() {
        let event = run(json!({"hook_event_name": "PostToolUse",
                               "tool_name": "Bash",
                               "tool_output": "z".repeat(15_000)}));
        let s = event.tool_output.unwrap();
        let s = s.as_str().unwrap();
        assert!(s.ends_with("... [truncated, 15000 chars total]"));
    }
}
