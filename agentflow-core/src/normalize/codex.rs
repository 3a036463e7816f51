//! Codex CLI dialect
//!
//! Thread/turn/item events from `codex exec --json`, dispatched on `type`
//! with a sub-table on `item.type` for item lifecycle events. Tool items
//! (`command_execution`, `file_change`) become `tool.start`/`tool.end`;
//! agent messages surface as assistant messages.

use super::{message_event, raw_fallback, truncate_tool_output, Ctx};
use crate::types::{Event, EventCategory, Role};
use serde_json::Value;

type BuildFn = fn(&Ctx) -> Event;

/// `type` -> builder, first match wins.
const EVENT_RULES: &[(&str, BuildFn)] = &[
    ("thread.started", thread_started),
    ("turn.started", turn_started),
    ("turn.completed", turn_completed),
    ("item.started", item_started),
    ("item.completed", item_completed),
    ("error", error),
];

/// `item.type` -> builder for `item.started`.
const ITEM_STARTED_RULES: &[(&str, BuildFn)] = &[
    ("command_execution", command_started),
    ("file_change", file_change_started),
    ("agent_message", agent_message),
];

/// `item.type` -> builder for `item.completed`; only tool items map.
const ITEM_COMPLETED_RULES: &[(&str, BuildFn)] = &[
    ("command_execution", tool_completed),
    ("file_change", tool_completed),
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

fn item<'a>(ctx: &'a Ctx) -> &'a Value {
    ctx.raw.get("item").unwrap_or(&Value::Null)
}

fn item_type<'a>(ctx: &'a Ctx) -> &'a str {
    item(ctx).get("type").and_then(Value::as_str).unwrap_or("")
}

fn dispatch_item(ctx: &Ctx, rules: &[(&str, BuildFn)]) -> Event {
    let kind = item_type(ctx);
    for (name, build) in rules {
        if *name == kind {
            return build(ctx);
        }
    }
    raw_fallback(ctx, Some(kind))
}

fn thread_started(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.start")
}

fn turn_started(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::System, "turn.start")
}

fn turn_completed(ctx: &Ctx) -> Event {
    ctx.event(EventCategory::Session, "session.end")
}

fn item_started(ctx: &Ctx) -> Event {
    dispatch_item(ctx, ITEM_STARTED_RULES)
}

fn item_completed(ctx: &Ctx) -> Event {
    dispatch_item(ctx, ITEM_COMPLETED_RULES)
}

fn command_started(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Tool, "tool.start");
    event.tool_name = Some("command_execution".to_string());
    event.tool_input = item(ctx)
        .get("command")
        .map(|c| serde_json::json!({ "command": c.clone() }));
    event
}

fn file_change_started(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Tool, "tool.start");
    event.tool_name = Some("file_change".to_string());
    let item = item(ctx);
    event.tool_input = Some(serde_json::json!({
        "file": item.get("file").cloned().unwrap_or(Value::Null),
        "patch": item.get("patch").cloned().unwrap_or(Value::Null),
    }));
    event
}

fn agent_message(ctx: &Ctx) -> Event {
    let text = item(ctx)
        .get("content")
        .and_then(Value::as_str)
        .map(|s| s.to_string());
    message_event(ctx, "message.assistant", Role::Assistant, text)
}

fn tool_completed(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Tool, "tool.end");
    event.tool_name = Some(item_type(ctx).to_string());
    event.tool_output = item(ctx).get("output").map(truncate_tool_output);
    event
}

fn error(ctx: &Ctx) -> Event {
    let mut event = ctx.event(EventCategory::Error, "error");
    event.error = ctx.first_str(&["message", "error"]);
    event
}
