//! Integration tests for the viewer WebSocket: connect handshake, snapshot in
//! hello-ok, ping, live broadcast of a webhook ingest, and viewer-token auth.
//! The server tasks are left running when the tests end.

use futures_util::{SinkExt, StreamExt};
use lib::config::{Config, ServerAuthMode};
use lib::server;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

const WEBHOOK_TOKEN: &str = "test-webhook-token";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn boot_server(viewer_token: Option<&str>) -> (String, u16) {
    let port = free_port();
    let mut config = Config::default();
    config.server.port = port;
    config.server.bind = "127.0.0.1".to_string();
    config.webhook.token = Some(WEBHOOK_TOKEN.to_string());
    if let Some(token) = viewer_token {
        config.server.auth.mode = ServerAuthMode::Token;
        config.server.auth.token = Some(token.to_string());
    }

    tokio::spawn(async move {
        let _ = server::run_server(config).await;
    });

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{}/health", base)).send().await {
            if resp.status().is_success() {
                return (base, port);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("server did not come up on {} within 5s", base);
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(port: u16) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    ws
}

async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame is JSON");
        }
    }
}

async fn send_req(ws: &mut WsStream, id: &str, method: &str, params: serde_json::Value) {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string())).await.expect("send request");
}

#[tokio::test]
async fn connect_returns_hello_ok_with_snapshot() {
    let (_base, port) = boot_server(None).await;
    let mut ws = ws_connect(port).await;

    send_req(&mut ws, "1", "connect", json!({ "client": { "id": "test" } })).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["type"], "res");
    assert_eq!(res["id"], "1");
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["type"], "hello-ok");
    assert_eq!(res["payload"]["protocol"], 1);
    assert_eq!(res["payload"]["snapshot"], json!([]));
}

#[tokio::test]
async fn requests_before_connect_are_rejected() {
    let (_base, port) = boot_server(None).await;
    let mut ws = ws_connect(port).await;

    send_req(&mut ws, "1", "snapshot", json!({})).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"], "connect required");
}

#[tokio::test]
async fn ping_answers_pong() {
    let (_base, port) = boot_server(None).await;
    let mut ws = ws_connect(port).await;

    send_req(&mut ws, "1", "connect", json!({})).await;
    next_json(&mut ws).await;

    send_req(&mut ws, "2", "ping", json!({})).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["id"], "2");
    assert_eq!(res["payload"]["pong"], true);
}

#[tokio::test]
async fn webhook_ingest_is_broadcast_to_connected_viewers() {
    let (base, port) = boot_server(None).await;
    let mut ws = ws_connect(port).await;

    send_req(&mut ws, "1", "connect", json!({})).await;
    next_json(&mut ws).await;

    let client = reqwest::Client::new();
    let body = json!({
        "type": "message",
        "entity": {
            "chatId": "conv-ws",
            "personType": "user",
            "plainText": "is anyone there?",
            "createdAt": 1715342400000i64
        },
        "refers": { "user": { "name": "Dana" } }
    });
    let resp = client
        .post(format!("{}/webhook?token={}", base, WEBHOOK_TOKEN))
        .json(&body)
        .send()
        .await
        .expect("webhook request");
    assert_eq!(resp.status(), 200);

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "event");
    assert_eq!(frame["event"], "conversation.pending");
    assert_eq!(frame["payload"]["id"], "conv-ws");
    assert_eq!(frame["payload"]["customerName"], "Dana");

    // staff reply clears it and viewers hear about that too
    let reply = json!({
        "type": "message",
        "entity": { "chatId": "conv-ws", "personType": "manager" }
    });
    client
        .post(format!("{}/webhook?token={}", base, WEBHOOK_TOKEN))
        .json(&reply)
        .send()
        .await
        .expect("webhook request");

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["event"], "conversation.answered");
    assert_eq!(frame["payload"]["conversationId"], "conv-ws");
    assert_eq!(frame["payload"]["reason"], "staff_reply");
}

#[tokio::test]
async fn viewer_token_is_enforced_when_configured() {
    let (_base, port) = boot_server(Some("viewer-secret")).await;

    let mut ws = ws_connect(port).await;
    send_req(&mut ws, "1", "connect", json!({})).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["ok"], false);

    let mut ws = ws_connect(port).await;
    send_req(&mut ws, "1", "connect", json!({ "auth": { "token": "wrong" } })).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["ok"], false);

    let mut ws = ws_connect(port).await;
    send_req(&mut ws, "1", "connect", json!({ "auth": { "token": "viewer-secret" } })).await;
    let res = next_json(&mut ws).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["type"], "hello-ok");
}
