//! Realtime gateway
//!
//! Long-lived WebSocket connections for dashboards. The handshake enforces
//! the same credential scheme as HTTP (plus an `api_key` query parameter,
//! since browsers cannot set headers on WebSocket upgrades). Each accepted
//! connection immediately receives the `sessions:list` snapshot, then
//! subscribes to session rooms on demand.
//!
//! Ordering contract per subscription: subscribe to the bus topic first,
//! then read and send the historical snapshot, then forward live messages,
//! dropping any event that was already in the snapshot. That order closes
//! the gap/duplicate window between history and live delivery.

use crate::http::{authenticate, Principal};
use crate::state::AppState;
use agentflow_core::bus::{session_topic, GLOBAL_TOPIC};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientCommand {
    #[serde(rename = "type")]
    command: String,
    #[serde(default)]
    session_id: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let principal = authenticate_handshake(&state, &headers, &query);
    match principal {
        Some(principal) => ws.on_upgrade(move |socket| handle_socket(socket, state, principal)),
        None => (StatusCode::UNAUTHORIZED, "Authentication required").into_response(),
    }
}

/// Handshake credentials: header, cookie, or `?api_key=` query parameter.
fn authenticate_handshake(
    state: &AppState,
    headers: &HeaderMap,
    query: &WsQuery,
) -> Option<Principal> {
    if let Some(principal) = authenticate(state, headers) {
        return Some(principal);
    }
    if let Some(key) = &query.api_key {
        if let Ok(Some(user_id)) = state.auth.verify_api_key(key) {
            return Some(Principal { user_id });
        }
    }
    None
}

async fn handle_socket(socket: WebSocket, state: AppState, _principal: Principal) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Snapshot of all sessions, before anything else
    match state.db.list_sessions() {
        Ok(sessions) => send_json(&tx, json!({"type": "sessions:list", "data": sessions})),
        Err(error) => tracing::error!(%error, "failed to load sessions for snapshot"),
    }

    // Every global broadcast is forwarded under its own name
    let global_task = {
        let tx = tx.clone();
        let mut sub = state.bus.subscribe(GLOBAL_TOPIC).await;
        tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                send_json(&tx, json!({"type": msg.name, "data": msg.data}));
            }
        })
    };

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    while let Some(msg) = ws_receiver.next().await {
        let Ok(msg) = msg else {
            break;
        };

        match msg {
            Message::Ping(bytes) => {
                let _ = tx.send(Message::Pong(bytes));
                continue;
            }
            Message::Close(_) => break,
            _ => {}
        }

        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            _ => continue,
        };

        let command: ClientCommand = match serde_json::from_str(&text) {
            Ok(command) => command,
            Err(_) => continue,
        };

        match command.command.as_str() {
            "subscribe" => {
                let Some(session_id) = command.session_id else {
                    continue;
                };
                if subscriptions.contains_key(&session_id) {
                    continue;
                }
                match start_subscription(&state, &tx, &session_id).await {
                    Ok(handle) => {
                        subscriptions.insert(session_id, handle);
                    }
                    Err(error) => {
                        // The connection survives handler errors
                        tracing::error!(%error, session_id, "subscribe failed");
                    }
                }
            }
            "unsubscribe" => {
                let Some(session_id) = command.session_id else {
                    continue;
                };
                if let Some(handle) = subscriptions.remove(&session_id) {
                    handle.abort();
                }
            }
            _ => {}
        }
    }

    // Disconnect is cooperative cancellation: drop everything
    for (_, handle) in subscriptions {
        handle.abort();
    }
    global_task.abort();
    drop(tx);
    if tokio::time::timeout(Duration::from_millis(200), &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
}

/// Join the session room, deliver the one-shot history, then forward live
/// events. Events that raced into both the room and the snapshot are
/// dropped on the live side by id.
async fn start_subscription(
    state: &AppState,
    tx: &mpsc::UnboundedSender<Message>,
    session_id: &str,
) -> agentflow_core::Result<JoinHandle<()>> {
    let mut sub = state.bus.subscribe(&session_topic(session_id)).await;
    let events = state.db.get_session_events(session_id)?;

    let mut snapshot_ids: HashSet<String> = events.iter().map(|e| e.id.clone()).collect();
    send_json(
        tx,
        json!({"type": "session:events", "sessionId": session_id, "data": events}),
    );

    let tx = tx.clone();
    let handle = tokio::spawn(async move {
        while let Some(msg) = sub.recv().await {
            if msg.name == "event" && !snapshot_ids.is_empty() {
                if let Some(id) = msg.data.get("id").and_then(Value::as_str) {
                    if snapshot_ids.remove(id) {
                        continue;
                    }
                    // First event past the snapshot boundary; no more dupes
                    snapshot_ids.clear();
                }
            }
            send_json(&tx, json!({"type": msg.name, "data": msg.data}));
        }
    });
    Ok(handle)
}

fn send_json(tx: &mpsc::UnboundedSender<Message>, value: Value) {
    if let Ok(text) = serde_json::to_string(&value) {
        let _ = tx.send(Message::Text(text.into()));
    }
}
