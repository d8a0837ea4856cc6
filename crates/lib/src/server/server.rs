//! HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::event::{self, NormalizedEvent, WebhookPayload};
use crate::pending::PendingConversation;
use crate::server::protocol::{
    event_frame, ConnectParams, ConversationView, HelloOk, HelloPolicy, WsRequest, WsResponse,
};
use crate::store::{self, PendingStore, UpsertOutcome};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Shared state for the server (config, store, broadcast bus).
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub store: Arc<dyn PendingStore>,
    /// Token the vendor must send with every webhook delivery.
    pub webhook_token: String,
    /// When Some, WebSocket connect must provide a matching auth token.
    pub viewer_token: Option<String>,
    /// Broadcasts event frames to connected viewers. Subscribers receive JSON text.
    pub event_tx: broadcast::Sender<String>,
    /// Currently connected viewer sockets (for the health endpoint).
    pub viewer_count: Arc<AtomicUsize>,
}

impl ServerState {
    /// Fan an event frame out to all connected viewers. Best-effort: no viewers is fine.
    fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let _ = self.event_tx.send(event_frame(event, payload));
    }
}

/// Check the webhook token from `?token=` or the `X-Webhook-Token` header.
/// Comparison is case-insensitive (the vendor has sent both cases over time).
fn webhook_token_ok(
    expected: &str,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> bool {
    let provided = params
        .get("token")
        .map(|s| s.as_str())
        .or_else(|| headers.get("x-webhook-token").and_then(|v| v.to_str().ok()));
    match provided {
        Some(token) => token.trim().eq_ignore_ascii_case(expected),
        None => false,
    }
}

/// Run the server; binds to config.server.bind:config.server.port.
/// A webhook token must be configured, and when bind is not loopback a viewer
/// token must be configured too, or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_server(config: Config) -> Result<()> {
    let bind = config.server.bind.trim().to_string();
    let viewer_token = config::resolve_viewer_token(&config);
    if !config::is_loopback_bind(&bind) {
        if viewer_token.is_none() || config.server.auth.mode != config::ServerAuthMode::Token {
            anyhow::bail!(
                "refusing to bind server to {} without viewer auth (set server.auth.mode to \"token\" and server.auth.token or DESKWATCH_VIEWER_TOKEN)",
                bind
            );
        }
    }
    let viewer_token = if config.server.auth.mode == config::ServerAuthMode::Token {
        viewer_token
    } else {
        None
    };

    let Some(webhook_token) = config::resolve_webhook_token(&config) else {
        anyhow::bail!(
            "no webhook token configured (set webhook.token or DESKWATCH_WEBHOOK_TOKEN)"
        );
    };

    let store = store::build_store(&config.store).await;
    log::info!("pending store backend: {}", store.backend());

    let (event_tx, _) = broadcast::channel(64);
    let state = ServerState {
        config: Arc::new(config.clone()),
        store,
        webhook_token,
        viewer_token,
        event_tx: event_tx.clone(),
        viewer_count: Arc::new(AtomicUsize::new(0)),
    };

    let sweep_running = Arc::new(AtomicBool::new(true));
    let sweep_handle = spawn_sweep(state.clone(), sweep_running.clone());

    let app = Router::new()
        .route("/", get(health_http))
        .route("/health", get(health_http))
        .route("/webhook", post(webhook_handler))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/:id/resolve", post(resolve_conversation))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, sweep_running, sweep_handle))
        .await
        .context("server exited")?;
    log::info!("server stopped");
    Ok(())
}

/// Periodic eviction of conversations past their TTL. Each evicted id is
/// broadcast as `conversation.expired` so viewers drop the entry; expiry is
/// treated as answered/abandoned, not an error.
fn spawn_sweep(state: ServerState, running: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = state.config.store.ttl();
        let mut ticker = tokio::time::interval(state.config.store.sweep_interval());
        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            match state.store.sweep_expired(ttl).await {
                Ok(evicted) => {
                    if !evicted.is_empty() {
                        log::info!("sweep evicted {} expired conversation(s)", evicted.len());
                    }
                    for id in evicted {
                        state.broadcast("conversation.expired", json!({ "conversationId": id }));
                    }
                }
                Err(e) => log::warn!("sweep failed: {}", e),
            }
        }
        log::info!("sweep task stopped");
    })
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to viewers and stops the sweep task.
async fn shutdown_signal(
    event_tx: broadcast::Sender<String>,
    sweep_running: Arc<AtomicBool>,
    sweep_handle: JoinHandle<()>,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
    sweep_running.store(false, Ordering::SeqCst);
    sweep_handle.abort();
    let _ = sweep_handle.await;
}

/// POST /webhook — vendor event delivery. Token-guarded; unknown payloads are
/// acknowledged as ignored so the vendor does not retry them.
async fn webhook_handler(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    if !webhook_token_ok(&state.webhook_token, &params, &headers) {
        log::warn!("webhook delivery rejected: bad or missing token");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "invalid token" })));
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            log::warn!("webhook delivery rejected: malformed JSON: {}", e);
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "malformed payload" })));
        }
    };

    match event::normalize(&payload, Utc::now()) {
        NormalizedEvent::CustomerMessage(conv) => ingest_customer_message(&state, conv).await,
        NormalizedEvent::StaffReply { conversation_id } => {
            mark_answered(&state, &conversation_id, "staff_reply").await
        }
        NormalizedEvent::ConversationClosed { conversation_id } => {
            mark_answered(&state, &conversation_id, "closed").await
        }
        NormalizedEvent::Ignored { reason } => {
            log::debug!("webhook delivery ignored: {}", reason);
            (StatusCode::OK, Json(json!({ "status": "ignored" })))
        }
    }
}

async fn ingest_customer_message(
    state: &ServerState,
    conv: PendingConversation,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.upsert(conv.clone()).await {
        Ok(UpsertOutcome::Duplicate) => {
            // re-delivered event: no state change, no broadcast
            log::debug!("duplicate delivery for conversation {}", conv.id);
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Ok(outcome) => {
            log::info!(
                "conversation {} pending ({:?}) from {}",
                conv.id,
                outcome,
                conv.customer_name
            );
            let view = ConversationView::new(&conv, Utc::now());
            state.broadcast(
                "conversation.pending",
                serde_json::to_value(&view).unwrap_or_else(|_| json!({})),
            );
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Err(e) => {
            log::error!("storing conversation {} failed: {}", conv.id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "store failure" })))
        }
    }
}

/// Remove a conversation and broadcast `conversation.answered` when it was pending.
/// Removing an id that is not pending is a no-op, not an error.
async fn mark_answered(
    state: &ServerState,
    conversation_id: &str,
    reason: &str,
) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.remove(conversation_id).await {
        Ok(true) => {
            log::info!("conversation {} answered ({})", conversation_id, reason);
            state.broadcast(
                "conversation.answered",
                json!({ "conversationId": conversation_id, "reason": reason }),
            );
            (StatusCode::OK, Json(json!({ "status": "ok" })))
        }
        Ok(false) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            log::error!("removing conversation {} failed: {}", conversation_id, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "store failure" })))
        }
    }
}

/// Current snapshot as viewer payload entries, longest wait first.
async fn snapshot_views(state: &ServerState) -> Result<Vec<ConversationView>, crate::store::StoreError> {
    let now = Utc::now();
    let snapshot = state.store.snapshot().await?;
    Ok(snapshot.iter().map(|c| ConversationView::new(c, now)).collect())
}

/// GET /api/conversations — REST snapshot of everything still waiting.
async fn list_conversations(
    State(state): State<ServerState>,
) -> (StatusCode, Json<serde_json::Value>) {
    match snapshot_views(&state).await {
        Ok(views) => (
            StatusCode::OK,
            Json(json!({
                "conversations": views,
                "total": views.len(),
                "timestamp": Utc::now().to_rfc3339(),
            })),
        ),
        Err(e) => {
            log::error!("snapshot failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "store failure" })))
        }
    }
}

/// POST /api/conversations/:id/resolve — operator marked the conversation answered.
async fn resolve_conversation(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    mark_answered(&state, &id, "resolved_manually").await
}

/// GET / and GET /health return health JSON (for probes).
async fn health_http(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let pending = state.store.len().await.ok();
    Json(json!({
        "status": "ok",
        "protocol": PROTOCOL_VERSION,
        "backend": state.store.backend(),
        "pending": pending,
        "viewers": state.viewer_count.load(Ordering::SeqCst),
    }))
}

/// GET /ws upgrades to WebSocket. First request must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<ServerState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let mut connected = false;
    let mut event_rx = state.event_tx.subscribe();
    state.viewer_count.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("viewer lagged {} broadcast frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };

                if req.typ != "req" {
                    continue;
                }
                if !connected && req.method != "connect" {
                    let res = WsResponse::err(&req.id, "connect required");
                    let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                    continue;
                }

                match req.method.as_str() {
                    "connect" => {
                        let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                            Ok(p) => p,
                            Err(_) => {
                                let res = WsResponse::err(&req.id, "invalid connect params");
                                let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                                continue;
                            }
                        };
                        if let Some(ref required) = state.viewer_token {
                            let provided = params.auth.token.as_deref().unwrap_or("").trim();
                            if provided.is_empty() {
                                let res = WsResponse::err(
                                    &req.id,
                                    "unauthorized: viewer token missing (set DESKWATCH_VIEWER_TOKEN or server.auth.token)",
                                );
                                let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                                continue;
                            }
                            if provided != required {
                                let res = WsResponse::err(&req.id, "unauthorized: viewer token mismatch");
                                let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                                continue;
                            }
                        }
                        let snapshot = match snapshot_views(&state).await {
                            Ok(views) => views,
                            Err(e) => {
                                log::error!("snapshot for connect failed: {}", e);
                                Vec::new()
                            }
                        };
                        let protocol = params.max_protocol.unwrap_or(PROTOCOL_VERSION).min(PROTOCOL_VERSION);
                        let hello = HelloOk {
                            typ: "hello-ok".to_string(),
                            protocol,
                            snapshot,
                            policy: Some(HelloPolicy {
                                ping_interval_ms: Some(15_000),
                            }),
                        };
                        let res = WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})));
                        if socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await.is_ok() {
                            connected = true;
                        }
                    }
                    "snapshot" => {
                        match snapshot_views(&state).await {
                            Ok(views) => {
                                let payload = json!({ "conversations": views, "total": views.len() });
                                let res = WsResponse::ok(&req.id, payload);
                                let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                            }
                            Err(e) => {
                                let res = WsResponse::err(&req.id, e.to_string());
                                let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                            }
                        }
                    }
                    "ping" => {
                        let res = WsResponse::ok(&req.id, json!({ "pong": true }));
                        let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                    }
                    "health" => {
                        let pending = state.store.len().await.ok();
                        let payload = json!({
                            "status": "ok",
                            "protocol": PROTOCOL_VERSION,
                            "backend": state.store.backend(),
                            "pending": pending,
                        });
                        let res = WsResponse::ok(&req.id, payload);
                        let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                    }
                    _ => {
                        let res = WsResponse::err(&req.id, format!("unknown method: {}", req.method));
                        let _ = socket.send(Message::Text(serde_json::to_string(&res).unwrap_or_default())).await;
                    }
                }
            }
        }
    }

    state.viewer_count.fetch_sub(1, Ordering::SeqCst);
    if !connected {
        log::debug!("viewer disconnected before sending connect");
    }
}
