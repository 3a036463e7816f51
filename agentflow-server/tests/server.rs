//! End-to-end tests for the agent-flow server
//!
//! Each test boots the full axum app on an ephemeral listener and drives it
//! over real HTTP and WebSocket connections.

use agentflow_core::auth::AuthService;
use agentflow_core::bus::EventBus;
use agentflow_core::{Config, Database};
use agentflow_server::http::build_router;
use agentflow_server::state::AppState;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{json, Value};
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    api_key: String,
    state: AppState,
}

async fn spawn_server() -> TestServer {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.migrate().unwrap();
    let config = Arc::new(Config {
        auth_secret: Some("test-secret".into()),
        ..Config::default()
    });
    let auth = Arc::new(AuthService::new(db.clone(), &config).unwrap());

    let user = auth
        .create_user("dev@example.com", Some("Dev"), "hunter2hunter2")
        .unwrap();
    let (_, api_key) = auth.create_api_key(&user.id, Some("test")).unwrap();

    let state = AppState::new(db, EventBus::new(), auth, config);
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        addr,
        api_key,
        state,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws?api_key={}", self.addr, self.api_key)
    }

    async fn ingest(&self, client: &reqwest::Client, session_id: &str, event: Value) -> Value {
        let response = client
            .post(self.url("/api/ingest"))
            .header("x-api-key", &self.api_key)
            .json(&json!({"source": "claude-code", "sessionId": session_id, "event": event}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("ws receive timed out")
            .expect("socket closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Receive until a message of the given type arrives.
async fn recv_type(ws: &mut WsStream, wanted: &str) -> Value {
    for _ in 0..50 {
        let msg = recv_json(ws).await;
        if msg["type"] == wanted {
            return msg;
        }
    }
    panic!("no {} message received", wanted);
}

// ============================================
// Auth
// ============================================

#[tokio::test]
async fn test_unauthenticated_requests_rejected() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client.get(server.url("/api/sessions")).send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Unauthorized"}));

    // Wrong key is as good as none
    let response = client
        .get(server.url("/api/sessions"))
        .header("x-api-key", "agentflow_deadbeef")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Health stays public
    let response = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_api_key_admits() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/api/sessions"))
        .header("x-api-key", &server.api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cookie_sign_in_flow() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    // Public sign-up is disabled
    let response = client
        .post(server.url("/api/auth/sign-up/email"))
        .json(&json!({"email": "new@example.com", "password": "longpassword"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Wrong password
    let response = client
        .post(server.url("/api/auth/sign-in/email"))
        .json(&json!({"email": "dev@example.com", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Sign in, capture the session cookie
    let response = client
        .post(server.url("/api/auth/sign-in/email"))
        .json(&json!({"email": "dev@example.com", "password": "hunter2hunter2"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    // The cookie admits API requests
    let response = client
        .get(server.url("/api/auth/get-session"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["user"]["email"], "dev@example.com");

    // And can mint an API key
    let response = client
        .post(server.url("/api/auth/api-key/create"))
        .header("cookie", &cookie)
        .json(&json!({"name": "from-cookie"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["key"].as_str().unwrap().starts_with("agentflow_"));
}

#[tokio::test]
async fn test_ws_handshake_requires_credentials() {
    let server = spawn_server().await;

    let result = connect_async(format!("ws://{}/ws", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
            let body = response
                .body()
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            assert!(body.contains("Authentication required"));
        }
        other => panic!("expected HTTP 401 rejection, got {:?}", other.map(|_| ())),
    }
}

// ============================================
// Ingest pipeline
// ============================================

#[tokio::test]
async fn test_ingest_validation() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    // Missing fields: 400 before any auth check
    let response = client
        .post(server.url("/api/ingest"))
        .json(&json!({"source": "claude-code"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Valid shape but no credentials: 401
    let response = client
        .post(server.url("/api/ingest"))
        .json(&json!({"source": "claude-code", "sessionId": "S1",
                      "event": {"hook_event_name": "SessionStart"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_full_claude_turn() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    // Subscribe before ingesting anything
    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    let listing = recv_type(&mut ws, "sessions:list").await;
    assert!(listing["data"].as_array().unwrap().is_empty());

    ws.send(Message::Text(
        json!({"type": "subscribe", "sessionId": "S1"}).to_string(),
    ))
    .await
    .unwrap();
    let snapshot = recv_type(&mut ws, "session:events").await;
    assert!(snapshot["data"].as_array().unwrap().is_empty());

    let raw_events = vec![
        json!({"hook_event_name": "SessionStart", "session_id": "S1"}),
        json!({"hook_event_name": "UserPromptSubmit", "session_id": "S1", "message": "fix bug"}),
        json!({"hook_event_name": "PreToolUse", "session_id": "S1",
               "tool_name": "Read", "tool_input": {"file_path": "a.ts"}}),
        json!({"hook_event_name": "PostToolUse", "session_id": "S1",
               "tool_name": "Read", "tool_output": "ok"}),
        json!({"hook_event_name": "Stop", "session_id": "S1"}),
    ];
    for raw in raw_events {
        let response = server.ingest(&client, "S1", raw).await;
        assert_eq!(response["ok"], true);
        assert!(response["eventId"].is_string());
    }

    // The subscriber observes exactly the normalized sequence, in order
    let mut observed = Vec::new();
    while observed.len() < 5 {
        let msg = recv_type(&mut ws, "event").await;
        observed.push(msg["data"].clone());
    }
    let types: Vec<_> = observed
        .iter()
        .map(|e| e["type"].as_str().unwrap().to_string())
        .collect();
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
    assert_eq!(observed[1]["text"], "fix bug");
    assert_eq!(observed[1]["role"], "user");
    assert_eq!(observed[2]["toolName"], "Read");
    assert_eq!(observed[3]["toolOutput"], "ok");
    assert_eq!(observed[4]["role"], "assistant");

    // Derived fields and effective status
    let response = client
        .get(server.url("/api/sessions/S1"))
        .header("x-api-key", &server.api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let session: Value = response.json().await.unwrap();
    assert_eq!(session["eventCount"], 5);
    assert_eq!(session["status"], "active");
    assert_eq!(session["events"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_tool_output_truncation() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    server
        .ingest(
            &client,
            "S1",
            json!({"hook_event_name": "PostToolUse", "tool_name": "Bash",
                   "tool_output": "x".repeat(15_000)}),
        )
        .await;

    let events = server.state.db.get_session_events("S1").unwrap();
    let stored = events[0].tool_output.as_ref().unwrap().as_str().unwrap();
    assert!(stored.starts_with(&"x".repeat(10_000)));
    assert!(stored.ends_with("... [truncated, 15000 chars total]"));
}

#[tokio::test]
async fn test_metadata_merge_from_ingest() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/api/ingest"))
        .header("x-api-key", &server.api_key)
        .json(&json!({
            "source": "claude-code",
            "sessionId": "S1",
            "event": {"hook_event_name": "SessionStart"},
            "user": {"name": "ada"},
            "git": {"branch": "main", "repo": "billing"}
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let session = server.state.db.get_session_row("S1").unwrap().unwrap();
    assert_eq!(session.metadata["user"]["name"], "ada");
    assert_eq!(session.metadata["git"]["branch"], "main");
    // Authenticated ingest attributes the session to its user
    assert!(session.user_id.is_some());
}

#[tokio::test]
async fn test_transcript_splice_on_stop() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let mut transcript = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        transcript,
        r#"{{"type":"user","message":{{"content":"prompt"}}}}"#
    )
    .unwrap();
    writeln!(
        transcript,
        r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"the final answer"}}]}}}}"#
    )
    .unwrap();
    transcript.flush().unwrap();

    server
        .ingest(
            &client,
            "S1",
            json!({"hook_event_name": "Stop",
                   "transcript_path": transcript.path().to_str().unwrap()}),
        )
        .await;

    let events = server.state.db.get_session_events("S1").unwrap();
    assert_eq!(events[0].event_type, "message.assistant");
    assert_eq!(events[0].text.as_deref(), Some("the final answer"));

    // A broken path is silently ignored; the event still lands
    server
        .ingest(
            &client,
            "S2",
            json!({"hook_event_name": "Stop", "transcript_path": "/does/not/exist.jsonl"}),
        )
        .await;
    let events = server.state.db.get_session_events("S2").unwrap();
    assert_eq!(events[0].event_type, "message.assistant");
    assert!(events[0].text.is_none());
}

// ============================================
// Sessions API
// ============================================

#[tokio::test]
async fn test_unknown_session_is_404() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .get(server.url("/api/sessions/nope"))
        .header("x-api-key", &server.api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_delete_and_clear_broadcast() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    server
        .ingest(&client, "S1", json!({"hook_event_name": "SessionStart"}))
        .await;
    server
        .ingest(&client, "S2", json!({"hook_event_name": "SessionStart"}))
        .await;

    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    recv_type(&mut ws, "sessions:list").await;

    let response = client
        .delete(server.url("/api/sessions/S1"))
        .header("x-api-key", &server.api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let msg = recv_type(&mut ws, "session:deleted").await;
    assert_eq!(msg["data"]["sessionId"], "S1");

    let response = client
        .delete(server.url("/api/sessions"))
        .header("x-api-key", &server.api_key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    recv_type(&mut ws, "sessions:cleared").await;

    assert!(server.state.db.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn test_hook_script_carries_origin() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    // Setup is behind admission like everything but /health
    let response = client
        .get(server.url("/setup/hook.sh"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(server.url("/setup/hook.sh"))
        .header("x-api-key", &server.api_key)
        .header("x-forwarded-proto", "https")
        .header("host", "flow.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-disposition")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("hook.sh"));
    let body = response.text().await.unwrap();
    assert!(body.contains("https://flow.example.com/api/ingest"));
}

// ============================================
// Realtime gateway
// ============================================

#[tokio::test]
async fn test_subscribe_then_live_no_gap_no_duplicate() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    // One historical event before the subscriber arrives
    server
        .ingest(&client, "S1", json!({"hook_event_name": "SessionStart"}))
        .await;

    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    recv_type(&mut ws, "sessions:list").await;

    ws.send(Message::Text(
        json!({"type": "subscribe", "sessionId": "S1"}).to_string(),
    ))
    .await
    .unwrap();
    let snapshot = recv_type(&mut ws, "session:events").await;
    let snapshot_events = snapshot["data"].as_array().unwrap().clone();
    assert_eq!(snapshot_events.len(), 1);
    let snapshot_id = snapshot_events[0]["id"].as_str().unwrap().to_string();

    // A live event after the subscribe is acknowledged
    server
        .ingest(
            &client,
            "S1",
            json!({"hook_event_name": "UserPromptSubmit", "message": "again"}),
        )
        .await;

    let live = recv_type(&mut ws, "event").await;
    let live_id = live["data"]["id"].as_str().unwrap();
    assert_eq!(live["data"]["type"], "message.user");
    // Not in the snapshot, and not the snapshot event re-delivered
    assert_ne!(live_id, snapshot_id);

    // Exactly one live delivery: nothing further pending
    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let msg = recv_json(&mut ws).await;
            if msg["type"] == "event" {
                return msg;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "unexpected duplicate event delivery");
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    recv_type(&mut ws, "sessions:list").await;

    ws.send(Message::Text(
        json!({"type": "subscribe", "sessionId": "S1"}).to_string(),
    ))
    .await
    .unwrap();
    recv_type(&mut ws, "session:events").await;

    ws.send(Message::Text(
        json!({"type": "unsubscribe", "sessionId": "S1"}).to_string(),
    ))
    .await
    .unwrap();
    // Give the server a beat to tear the subscription down
    tokio::time::sleep(Duration::from_millis(100)).await;

    server
        .ingest(&client, "S1", json!({"hook_event_name": "SessionStart"}))
        .await;

    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let msg = recv_json(&mut ws).await;
            if msg["type"] == "event" {
                return msg;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "event delivered after unsubscribe");
}

#[tokio::test]
async fn test_global_updates_reach_every_client() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let (mut ws, _) = connect_async(server.ws_url()).await.unwrap();
    recv_type(&mut ws, "sessions:list").await;

    // No subscription at all; the summary still arrives on global
    server
        .ingest(&client, "S9", json!({"hook_event_name": "SessionStart"}))
        .await;

    let update = recv_type(&mut ws, "session:update").await;
    assert_eq!(update["data"]["id"], "S9");
    assert_eq!(update["data"]["eventCount"], 1);
}

// ============================================
// Codex through the pipeline
// ============================================

#[tokio::test]
async fn test_codex_turn_through_ingest() {
    let server = spawn_server().await;
    let client = reqwest::Client::new();

    let raw_events = vec![
        json!({"type": "thread.started"}),
        json!({"type": "turn.started"}),
        json!({"type": "item.started", "item": {"type": "command_execution", "command": "ls"}}),
        json!({"type": "item.completed",
               "item": {"type": "command_execution", "command": "ls", "output": "a\nb"}}),
        json!({"type": "turn.completed"}),
    ];
    for raw in raw_events {
        let response = client
            .post(server.url("/api/ingest"))
            .header("x-api-key", &server.api_key)
            .json(&json!({"source": "codex", "sessionId": "C1", "event": raw}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    let events = server.state.db.get_session_events("C1").unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "session.start",
            "turn.start",
            "tool.start",
            "tool.end",
            "session.end"
        ]
    );

    // turn.completed marked the session completed
    let session = server.state.db.get_session("C1").unwrap().unwrap();
    assert_eq!(session.status, agentflow_core::SessionStatus::Completed);
}
