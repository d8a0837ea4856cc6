//! Viewer WebSocket protocol types (connect, snapshot, events).

use crate::pending::PendingConversation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Viewer connect params (first request on the socket).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Server hello-ok payload after successful connect: negotiated protocol plus
/// the current pending snapshot so the viewer renders without a second round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol: u32,
    pub snapshot: Vec<ConversationView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub ping_interval_ms: Option<u64>,
}

/// A pending conversation as sent to viewers, with the wait already computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    pub last_message: String,
    pub timestamp: DateTime<Utc>,
    pub wait_minutes: i64,
}

impl ConversationView {
    pub fn new(conv: &PendingConversation, now: DateTime<Utc>) -> Self {
        Self {
            id: conv.id.clone(),
            customer_name: conv.customer_name.clone(),
            team: conv.team.clone(),
            last_message: conv.last_message.clone(),
            timestamp: conv.timestamp,
            wait_minutes: conv.wait_minutes(now),
        }
    }
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// Build an event frame: `{ "type": "event", "event", "payload" }`.
pub fn event_frame(event: &str, payload: serde_json::Value) -> String {
    serde_json::to_string(&json!({
        "type": "event",
        "event": event,
        "payload": payload
    }))
    .unwrap_or_else(|_| format!(r#"{{"type":"event","event":"{}","payload":{{}}}}"#, event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn response_constructors_set_framing() {
        let ok = WsResponse::ok("7", json!({ "pong": true }));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains(r#""type":"res""#));
        assert!(text.contains(r#""ok":true"#));
        assert!(!text.contains("error"));

        let err = WsResponse::err("7", "connect required");
        assert!(!err.ok);
        assert_eq!(err.error.as_deref(), Some("connect required"));
        assert!(err.payload.is_none());
    }

    #[test]
    fn event_frame_wraps_payload() {
        let frame = event_frame("conversation.expired", json!({ "conversationId": "a" }));
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["event"], "conversation.expired");
        assert_eq!(value["payload"]["conversationId"], "a");
    }

    #[test]
    fn view_computes_wait_and_clamps_future_timestamps() {
        let now = Utc::now();
        let conv = PendingConversation {
            id: "a".to_string(),
            customer_name: "c".to_string(),
            team: None,
            last_message: "m".to_string(),
            fingerprint: "f".to_string(),
            timestamp: now - Duration::minutes(12),
        };
        assert_eq!(ConversationView::new(&conv, now).wait_minutes, 12);

        let future = PendingConversation {
            timestamp: now + Duration::minutes(5),
            ..conv
        };
        assert_eq!(ConversationView::new(&future, now).wait_minutes, 0);
    }

    #[test]
    fn connect_params_tolerate_missing_fields() {
        let params: ConnectParams = serde_json::from_str("{}").unwrap();
        assert!(params.auth.token.is_none());
        assert!(params.max_protocol.is_none());
    }
}
