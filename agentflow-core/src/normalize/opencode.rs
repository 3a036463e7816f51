//! OpenCode dialect
//!
//! OpenCode shows up in two shapes: hook-style server events
//! (`session.created`, `session.idle`, `message.updated`,
//! `message.part.updated`) and jsonl-style export records (`step_start`,
//! `step_finish`, `text`, `tool_use`). Both funnel through one rule table;
//! part-carrying events sub-dispatch on `part.type`.

use super::{message_event, raw_fallback, truncate_tool_output, Ctx};
use crate::types::{Event, EventCategory, Role};
use serde_json::Value;

type BuildFn = fn(&Ctx) -> Event;

/// `type` -> builder, first match wins. Hook-style rules first, then the
/// jsonl-style records.
const EVENT_RULES: &[(&str, BuildFn)] = &[
    ("session.created", session_created),
    ("session.idle", session_idle),
    ("message.updated", message_updated),
    ("message.part.updated", part_updated),
    ("step_start", step_start),
    ("step_finish", step_finish),
    ("text", text_record),
    ("tool_use", tool_use_record),
];

pub(crate) fn normalize(ctx: &Ctx) -> Event {
    let event_type = ctx.raw.get("type").and_then(Value::as_str).unwrap_or("");

    for (name, build) in EVENT_RULES {
        if *name == event_type {
            return build(ctx);
        }
    }
    raw_fallback(ctx, Some(event_type))
}

/// `_role` / `role` on the payload (or its message) decide user vs assistant;
/// assistant is the default for unlabeled parts.
fn role_of(ctx: &Ctx) -> Role {
    let role = ctx
        .raw
        .get("_role")
        .or_else(|| ctx.raw.get("role"))
        .or_else(|| ctx.raw.get("message").and_then(|m| m.get("role")))
        .and_then(Value::as_str)
        .unwrap_or("assistant");
    if role == "user" {
        Role::User
    } else {
        Role::Assistant
    }
}

fn message_type_for(role: Role) -> &'static str {
    match role {
        Role::User => "message.user",
        _ => "message.assistant",
    }
}

fn part<'a>(ctx: &'a Ctx) -> &'a Value {
    ctx.raw.get("part").unwrap_or(&Value::Null)
}

fn session_created(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.start")
}

// No explicit end signal from OpenCode; idle is the lifecycle boundary.
fn session_idle(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.end")
}

fn message_updated(ctx: &Ctx) -> Event {
    let part = part(ctx);
    let part_is_text = part.get("type").and_then(Value::as_str) == Some("text");
    let text = if part_is_text {
        part.get("text").and_then(Value::as_str)
    } else {
        ctx.raw.get("text").and_then(Value::as_str)
    };

    match text {
        Some(text) => {
            let role = role_of(ctx);
            message_event(ctx, message_type_for(role), role, Some(text.to_string()))
        }
        // Payloads without a text part carry nothing we can classify
        None => raw_fallback(ctx, Some("message.updated")),
    }
}

fn part_updated(ctx: &Ctx) -> Event {
    let part = part(ctx);
    match part.get("type").and_then(Value::as_str) {
        Some("text") => {
            let role = role_of(ctx);
            let text = part.get("text").and_then(Value::as_str).map(String::from);
            message_event(ctx, message_type_for(role), role, text)
        }
        Some("tool") => tool_part(ctx, part),
        _ => raw_fallback(ctx, Some("message.part.updated")),
    }
}

fn tool_part(ctx: &Ctx, part: &Value) -> Event {
    let state = part.get("state").unwrap_or(&Value::Null);
    let status = state.get("status").and_then(Value::as_str).unwrap_or("");
    let tool_name = part
        .get("tool")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    let part_id = part.get("id").cloned();

    let mut event = match status {
        "running" => {
            let mut event = ctx.event(EventCategory::Tool, "tool.start");
            event.tool_input = state.get("input").cloned();
            event
        }
        "completed" => {
            let mut event = ctx.event(EventCategory::Tool, "tool.end");
            event.tool_output = state.get("output").map(truncate_tool_output);
            event
        }
        _ => return raw_fallback(ctx, Some("message.part.updated")),
    };
    event.tool_name = tool_name;
    if let Some(id) = part_id {
        event.meta = Some(serde_json::json!({ "partId": id }));
    }
    event
}

fn step_start(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::System, "step.start")
}

fn step_finish(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::System, "step.finish")
}

fn text_record(ctx: &Ctx) -> Event {
    let role = role_of(ctx);
    let text = ctx.first_str(&["text", "content"]);
    message_event(ctx, message_type_for(role), role, text)
}

fn tool_use_record(ctx: &Ctx) -> Event {
    // A record carrying output is the completion; otherwise the invocation.
    let has_output = ctx.raw.get("output").is_some();
    let mut event = if has_output {
        let mut event = ctx.event(EventCategory::Tool, "tool.end");
        event.tool_output = ctx.raw.get("output").map(truncate_tool_output);
        event
    } else {
        let mut event = ctx.event(EventCategory::Tool, "tool.start");
        event.tool_input = ctx.raw.get("input").cloned();
        event
    };
    event.tool_name = ctx.first_str(&["name", "tool"]);
    event
}

#[cfg(test)]
mod tests {
    use crate::normalize::normalize;
    use crate::types::{EventCategory, EventSource, Role};
    use serde_json::json;

    fn run(raw: serde_json::Value) -> crate::types::Event {
        normalize(&EventSource::Opencode, "S1", &raw)
    }

    #[test]
    fn test_session_lifecycle() {
        let event = run(json!({"type": "session.created"}));
        assert_eq!(event.event_type, "session.start");

        let event = run(json!({"type": "session.idle"}));
        assert_eq!(event.event_type, "session.end");
    }

    #[test]
    fn test_tool_part_running_then_completed() {
        let event = run(json!({"type": "message.part.updated",
                               "part": {"id": "p1", "type": "tool", "tool": "bash",
                                        "state": {"status": "running", "input": {"command": "ls"}}}}));
        assert_eq!(event.event_type, "tool.start");
        assert_eq!(event.tool_name.as_deref(), Some("bash"));
        assert_eq!(event.tool_input.as_ref().unwrap()["command"], "ls");
        assert_eq!(event.meta.as_ref().unwrap()["partId"], "p1");

        let event = run(json!({"type": "message.part.updated",
                               "part": {"id": "p1", "type": "tool", "tool": "bash",
                                        "state": {"status": "completed", "output": "a\nb"}}}));
        assert_eq!(event.event_type, "tool.end");
        assert_eq!(event.tool_output, Some(json!("a\nb")));
        assert_eq!(event.meta.as_ref().unwrap()["partId"], "p1");
    }

    #[test]
    fn test_text_part_roles() {
        let event = run(json!({"type": "message.part.updated", "_role": "user",
                               "part": {"type": "text", "text": "hello"}}));
        assert_eq!(event.event_type, "message.user");
        assert_eq!(event.role, Some(Role::User));
        assert_eq!(event.text.as_deref(), Some("hello"));

        let event = run(json!({"type": "message.part.updated", "role": "assistant",
                               "part": {"type": "text", "text": "hi"}}));
        assert_eq!(event.event_type, "message.assistant");
    }

    #[test]
    fn test_message_updated_without_text_part_is_system() {
        let event = run(json!({"type": "message.updated", "message": {"id": "m1"}}));
        assert_eq!(event.category, EventCategory::System);
        assert!(event.meta.is_some());
    }

    #[test]
    fn test_message_updated_with_text_part() {
        let event = run(json!({"type": "message.updated", "_role": "user",
                               "part": {"type": "text", "text": "try again"}}));
        assert_eq!(event.event_type, "message.user");
        assert_eq!(event.text.as_deref(), Some("try again"));
    }

    #[test]
    fn test_jsonl_records() {
        let event = run(json!({"type": "step_start"}));
        assert_eq!(event.event_type, "step.start");
        assert_eq!(event.category, EventCategory::System);

        let event = run(json!({"type": "text", "role": "assistant", "text": "working on it"}));
        assert_eq!(event.event_type, "message.assistant");

        let event = run(json!({"type": "tool_use", "name": "grep", "input": {"pattern": "fn"}}));
        assert_eq!(event.event_type, "tool.start");
        assert_eq!(event.tool_name.as_deref(), Some("grep"));

        let event = run(json!({"type": "tool_use", "name": "grep", "output": "3 matches"}));
        assert_eq!(event.event_type, "tool.end");
    }

    #[test]
    fn test_pending_tool_status_is_system() {
        let event = run(json!({"type": "message.part.updated",
                               "part": {"type": "tool", "tool": "bash",
                                        "state": {"status": "pending"}}}));
        assert_eq!(event.category, EventCategory::System);
    }
}
