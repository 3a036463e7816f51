//! Local tools the analyzer can call
//!
//! Both schedulers grant the chat client the same store-backed tools: a
//! read-only SQL tool over the event tables and a schema tool. Tool errors
//! are returned to the model as data, never surfaced as handler errors.

use crate::state::AppState;
use agentflow_core::analyzer::ToolSpec;
use agentflow_core::CronJob;
use serde_json::{json, Value};

const MAX_SQL_ROWS: usize = 200;

pub fn analyzer_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "query_events".to_string(),
            description: "Run a read-only SQL SELECT over the observability database \
                          (sessions, events, insights, cron_jobs). Returns at most 200 rows."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {"type": "string", "description": "A single SELECT statement"}
                },
                "required": ["sql"]
            }),
        },
        ToolSpec {
            name: "get_schema".to_string(),
            description: "Get the CREATE TABLE statements of the observability database."
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

pub fn cron_tool_specs(job: &CronJob) -> Vec<ToolSpec> {
    let mut specs = analyzer_tool_specs();
    if job.notify_slack {
        specs.push(ToolSpec {
            name: "notify".to_string(),
            description: "Send a notification message to the configured channel.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {"type": "string"}
                },
                "required": ["message"]
            }),
        });
    }
    specs
}

/// Execute a tool call locally. Unknown tools and SQL violations come back
/// as `{"error": ...}` payloads for the model to read.
pub async fn dispatch(state: &AppState, name: &str, input: &Value) -> Value {
    match name {
        "query_events" => {
            let sql = input.get("sql").and_then(Value::as_str).unwrap_or("");
            run_select(state, sql)
        }
        "get_schema" => match state.db.schema_ddl() {
            Ok(ddl) => json!({"schema": ddl.join(";\n")}),
            Err(error) => json!({"error": error.to_string()}),
        },
        "notify" => {
            let message = input.get("message").and_then(Value::as_str).unwrap_or("");
            tracing::info!(message, "cron notification");
            json!({"ok": true})
        }
        other => json!({"error": format!("unknown tool: {}", other)}),
    }
}

fn run_select(state: &AppState, sql: &str) -> Value {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if !trimmed.to_ascii_lowercase().starts_with("select") {
        return json!({"error": "only SELECT statements are allowed"});
    }
    if trimmed.contains(';') {
        return json!({"error": "only a single statement is allowed"});
    }
    match state.db.query_json(trimmed, MAX_SQL_ROWS) {
        Ok(rows) => json!({"rows": rows}),
        Err(error) => json!({"error": error.to_string()}),
    }
}
