//! HTTP surface: ingest, queries, auth, setup
//!
//! Admission model: everything under `/api/` requires a credential -
//! `x-api-key` header first, session cookie second - except `/health`.
//! Unauthenticated requests get a static `{"error":"Unauthorized"}` with no
//! side effects. Validation failures are 400, unknown sessions 404, storage
//! faults 500 with the message; handlers never retry.

use crate::pipeline::publish_event;
use crate::state::AppState;
use crate::transcript;
use agentflow_core::auth::SESSION_COOKIE;
use agentflow_core::bus::{BusMessage, GLOBAL_TOPIC};
use agentflow_core::normalize::normalize;
use agentflow_core::{CronJob, Error, EventSource};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use cron::Schedule;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/setup/hook.sh", get(hook_script))
        .route("/api/ingest", post(ingest))
        .route("/api/sessions", get(list_sessions).delete(clear_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/insights", get(list_insights))
        .route("/api/cron", get(list_cron_jobs).post(create_cron_job))
        .route("/api/cron/{id}/trigger", post(trigger_cron_job))
        .route("/api/auth/sign-in/email", post(sign_in))
        .route("/api/auth/sign-up/email", post(sign_up))
        .route("/api/auth/get-session", get(get_auth_session))
        .route("/api/auth/api-key/create", post(create_api_key))
        .route("/ws", get(crate::ws::upgrade))
        .with_state(state)
}

// ============================================
// Admission
// ============================================

/// The principal a credential resolved to.
pub struct Principal {
    pub user_id: String,
}

/// Check credentials in order: `x-api-key` header, then session cookie.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<Principal> {
    if let Some(key) = header_str(headers, "x-api-key") {
        if let Ok(Some(user_id)) = state.auth.verify_api_key(key) {
            return Some(Principal { user_id });
        }
    }
    if let Some(token) = cookie_value(headers, SESSION_COOKIE) {
        if let Ok(Some(user_id)) = state.auth.verify_session_token(&token) {
            return Some(Principal { user_id });
        }
    }
    None
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = header_str(headers, "cookie")?;
    for pair in cookies.split(';') {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not found"})),
    )
        .into_response()
}

fn internal_error(error: Error) -> Response {
    tracing::error!(%error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": error.to_string()})),
    )
        .into_response()
}

// ============================================
// Public endpoints
// ============================================

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Shell adapter for Claude Code hooks, with the public origin baked in.
///
/// The origin comes from `X-Forwarded-Proto` + `Host` when a proxy set
/// them, falling back to the local listen address.
async fn hook_script(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    let origin = match header_str(&headers, "host") {
        Some(host) => {
            let proto = header_str(&headers, "x-forwarded-proto").unwrap_or("http");
            format!("{}://{}", proto, host)
        }
        None => format!("http://localhost:{}", state.config.port),
    };

    let script = format!(
        r#"#!/usr/bin/env bash
# agent-flow hook adapter for Claude Code.
# Register this script for the hook events you want observed; it forwards
# each hook payload to {origin}/api/ingest. Set AGENT_FLOW_API_KEY in the
# environment Claude Code runs in.
set -u

ORIGIN="{origin}"
API_KEY="${{AGENT_FLOW_API_KEY:-}}"

payload="$(cat)"
session_id="$(printf '%s' "$payload" | sed -n 's/.*"session_id"[[:space:]]*:[[:space:]]*"\([^"]*\)".*/\1/p' | head -n1)"
[ -n "$session_id" ] || session_id="unknown"

curl -fsS -m 5 -X POST "$ORIGIN/api/ingest" \
  -H 'Content-Type: application/json' \
  -H "x-api-key: $API_KEY" \
  -d "{{\"source\":\"claude-code\",\"sessionId\":\"$session_id\",\"event\":$payload}}" \
  >/dev/null 2>&1 || true
"#
    );

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"hook.sh\"",
            ),
        ],
        script,
    )
        .into_response()
}

// ============================================
// Ingest
// ============================================

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let source = body.get("source").and_then(Value::as_str);
    let session_id = body.get("sessionId").and_then(Value::as_str);
    let raw_event = body.get("event").filter(|e| !e.is_null());

    let (Some(source), Some(session_id), Some(raw_event)) = (source, session_id, raw_event)
    else {
        return bad_request("source, sessionId and event are required");
    };

    let Some(principal) = authenticate(&state, &headers) else {
        return unauthorized();
    };

    let source = EventSource::from(source);
    let mut raw_event = raw_event.clone();
    splice_transcript(&source, &mut raw_event).await;

    let event = normalize(&source, session_id, &raw_event);
    if let Err(error) = state.db.append(&event) {
        return internal_error(error);
    }

    if let Err(error) = state.db.set_session_user(session_id, &principal.user_id) {
        tracing::warn!(%error, session_id, "failed to associate session user");
    }

    let mut meta_patch = serde_json::Map::new();
    if let Some(user) = body.get("user").filter(|v| !v.is_null()) {
        meta_patch.insert("user".to_string(), user.clone());
    }
    if let Some(git) = body.get("git").filter(|v| !v.is_null()) {
        meta_patch.insert("git".to_string(), git.clone());
    }
    if !meta_patch.is_empty() {
        if let Err(error) = state
            .db
            .update_session_meta(session_id, &Value::Object(meta_patch))
        {
            return internal_error(error);
        }
    }

    if let Err(error) = publish_event(&state, &event).await {
        return internal_error(error);
    }

    Json(json!({"ok": true, "eventId": event.id})).into_response()
}

/// Claude Code `Stop` events without a `result` get the latest assistant
/// turn spliced in from the producer-local transcript file. Failures are
/// silent; the event is processed either way.
async fn splice_transcript(source: &EventSource, raw_event: &mut Value) {
    if *source != EventSource::ClaudeCode {
        return;
    }
    let is_stop = raw_event.get("hook_event_name").and_then(Value::as_str) == Some("Stop");
    let has_result = raw_event.get("result").is_some_and(|r| !r.is_null());
    if !is_stop || has_result {
        return;
    }
    let Some(path) = raw_event.get("transcript_path").and_then(Value::as_str) else {
        return;
    };

    let path = PathBuf::from(path);
    let text = tokio::task::spawn_blocking(move || transcript::latest_assistant_text(&path))
        .await
        .ok()
        .flatten();

    if let (Some(text), Some(obj)) = (text, raw_event.as_object_mut()) {
        obj.insert("result".to_string(), Value::String(text));
    }
}

// ============================================
// Sessions
// ============================================

async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    match state.db.list_sessions() {
        Ok(sessions) => Json(sessions).into_response(),
        Err(error) => internal_error(error),
    }
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    let session = match state.db.get_session(&id) {
        Ok(Some(session)) => session,
        Ok(None) => return not_found(),
        Err(error) => return internal_error(error),
    };
    let events = match state.db.get_session_events(&id) {
        Ok(events) => events,
        Err(error) => return internal_error(error),
    };

    let mut body = match serde_json::to_value(&session) {
        Ok(value) => value,
        Err(error) => return internal_error(error.into()),
    };
    body["events"] = json!(events);
    Json(body).into_response()
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    match state.db.delete_session(&id) {
        Ok(true) => {
            state.bus.remove_topic(&agentflow_core::bus::session_topic(&id)).await;
            state
                .bus
                .publish(
                    GLOBAL_TOPIC,
                    BusMessage::new("session:deleted", json!({"sessionId": id})),
                )
                .await;
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => not_found(),
        Err(error) => internal_error(error),
    }
}

async fn clear_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    match state.db.clear_all() {
        Ok(()) => {
            state
                .bus
                .publish(GLOBAL_TOPIC, BusMessage::new("sessions:cleared", json!({})))
                .await;
            Json(json!({"ok": true})).into_response()
        }
        Err(error) => internal_error(error),
    }
}

// ============================================
// Insights
// ============================================

async fn list_insights(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(principal) = authenticate(&state, &headers) else {
        return unauthorized();
    };
    match state.db.list_insights(&principal.user_id) {
        Ok(insights) => Json(insights).into_response(),
        Err(error) => internal_error(error),
    }
}

// ============================================
// Cron jobs
// ============================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCronJobRequest {
    name: String,
    prompt: String,
    cron_expression: String,
    #[serde(default)]
    schedule_text: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    notify_slack: bool,
}

fn default_true() -> bool {
    true
}

async fn list_cron_jobs(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    match state.db.list_cron_jobs() {
        Ok(jobs) => Json(jobs).into_response(),
        Err(error) => internal_error(error),
    }
}

async fn create_cron_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateCronJobRequest>,
) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }

    let schedule = match Schedule::from_str(&request.cron_expression) {
        Ok(schedule) => schedule,
        Err(_) => {
            return bad_request(&format!(
                "invalid cron expression: {}",
                request.cron_expression
            ))
        }
    };
    let next_run_at = schedule
        .upcoming(Utc)
        .next()
        .map(|dt| dt.timestamp_millis());

    let job = CronJob {
        id: Uuid::new_v4().to_string(),
        name: request.name,
        prompt: request.prompt,
        schedule_text: request
            .schedule_text
            .unwrap_or_else(|| request.cron_expression.clone()),
        cron_expression: request.cron_expression,
        timezone: request.timezone.unwrap_or_else(|| "UTC".to_string()),
        enabled: request.enabled,
        notify_slack: request.notify_slack,
        last_run_at: None,
        last_run_session_id: None,
        last_run_status: None,
        next_run_at,
        total_runs: 0,
        created_at: agentflow_core::now_ms(),
    };

    match state.db.insert_cron_job(&job) {
        Ok(()) => Json(job).into_response(),
        Err(error) => internal_error(error),
    }
}

async fn trigger_cron_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if authenticate(&state, &headers).is_none() {
        return unauthorized();
    }
    match state.db.get_cron_job(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(error) => return internal_error(error),
    }
    match &state.cron_trigger {
        Some(trigger) => {
            // Fire and forget; the runner's overlap guard still applies
            let _ = trigger.send(id.clone());
            (
                StatusCode::ACCEPTED,
                Json(json!({"ok": true, "jobId": id})),
            )
                .into_response()
        }
        None => bad_request("cron runner is not running"),
    }
}

// ============================================
// Auth endpoints (delegated identity surface)
// ============================================

#[derive(Debug, Deserialize)]
struct EmailCredentials {
    email: String,
    password: String,
}

async fn sign_in(
    State(state): State<AppState>,
    Json(credentials): Json<EmailCredentials>,
) -> Response {
    match state.auth.sign_in(&credentials.email, &credentials.password) {
        Ok(Some((user, token))) => {
            let cookie = format!(
                "{}={}; HttpOnly; Path=/; SameSite=Lax",
                SESSION_COOKIE, token
            );
            (
                [(header::SET_COOKIE, cookie)],
                Json(json!({"user": user})),
            )
                .into_response()
        }
        Ok(None) => unauthorized(),
        Err(error) => internal_error(error),
    }
}

/// Public sign-up is disabled by policy; users are created server-side
/// (invite redemption, CLI bootstrap).
async fn sign_up(State(_state): State<AppState>) -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": "Sign-up is disabled"})),
    )
        .into_response()
}

async fn get_auth_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(principal) = authenticate(&state, &headers) else {
        return unauthorized();
    };
    match state.auth.get_user(&principal.user_id) {
        Ok(Some(user)) => Json(json!({"user": user})).into_response(),
        Ok(None) => unauthorized(),
        Err(error) => internal_error(error),
    }
}

#[derive(Debug, Deserialize, Default)]
struct CreateApiKeyRequest {
    #[serde(default)]
    name: Option<String>,
}

async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateApiKeyRequest>>,
) -> Response {
    let Some(principal) = authenticate(&state, &headers) else {
        return unauthorized();
    };
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state
        .auth
        .create_api_key(&principal.user_id, request.name.as_deref())
    {
        Ok((key, raw)) => Json(json!({"id": key.id, "key": raw})).into_response(),
        Err(error) => internal_error(error),
    }
}
