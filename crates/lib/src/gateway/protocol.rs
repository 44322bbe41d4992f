//! Control-plane wire types (JSON Lines over WebSocket).
//!
//! Requests are `{id, method, params}`; responses `{id, ok, result?|error?}`;
//! server-pushed events `{event, payload}`. `id` is caller-chosen and unique
//! per socket.

use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WsError>,
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(
        id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(WsError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"id":"","ok":false,"error":{"code":"FATAL","message":"serialize"}}"#.to_string()
        })
    }
}

/// Serialize a server event frame.
pub fn event_frame(event: &str, payload: serde_json::Value) -> String {
    serde_json::to_string(&json!({ "event": event, "payload": payload }))
        .unwrap_or_else(|_| format!(r#"{{"event":"{}","payload":{{}}}}"#, event))
}

/// Params for `send`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    pub to: String,
    pub message: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub media: Vec<crate::envelope::MediaAttachment>,
}

/// Params for `agent` / `chat.send`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams {
    #[serde(default)]
    pub session_key: Option<String>,
    pub message: String,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub deliver: Option<bool>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Params for `chat.history`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryParams {
    pub session_key: String,
}

/// Params for `nodes.invoke`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInvokeParams {
    pub node_id: String,
    pub command: String,
    #[serde(default)]
    pub params_json: Option<String>,
}

/// Params for `cron.add`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronAddParams {
    pub schedule: String,
    pub message: String,
    #[serde(default)]
    pub session_key: Option<String>,
}

/// Params for `system-event`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEventParams {
    pub text: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}
