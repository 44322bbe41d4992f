//! NDJSON wire protocol to the agent worker subprocess. One JSON record per
//! line in both directions; requests carry a `runId` that every event echoes.

use crate::envelope::MediaAttachment;
use crate::session::ThinkingLevel;
use serde::{Deserialize, Serialize};

/// Request frames written to the worker's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerRequest {
    Run(RunRequest),
    Cancel { run_id: String },
}

/// One agent invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub run_id: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Prepended to the body verbatim (abort reminders, group primers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_prefix: Option<String>,
    pub body: String,
    pub thinking: ThinkingLevel,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub media: Vec<MediaAttachment>,
    pub model_ref: String,
    pub timeout_ms: u64,
}

/// Token usage reported by the worker on the final frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_used: Option<u64>,
}

/// Event frames read from the worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerEvent {
    /// First frame of a run; `session_id` is absent for backends that do not
    /// assign one (only Claude-class backends guarantee it).
    SessionStart {
        run_id: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    ToolStart {
        run_id: String,
        tool: String,
        #[serde(default)]
        arg: Option<String>,
    },
    ToolEnd {
        run_id: String,
        tool: String,
        #[serde(default)]
        preview: Option<String>,
    },
    /// Incremental text delta; may arrive many times.
    Text { run_id: String, delta: String },
    Final {
        run_id: String,
        text: String,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error {
        run_id: String,
        message: String,
        #[serde(default)]
        kind: Option<String>,
    },
    /// Resolves the run even when `final` was the last payload seen.
    AgentEnd { run_id: String },
}

impl WorkerEvent {
    pub fn run_id(&self) -> &str {
        match self {
            WorkerEvent::SessionStart { run_id, .. }
            | WorkerEvent::ToolStart { run_id, .. }
            | WorkerEvent::ToolEnd { run_id, .. }
            | WorkerEvent::Text { run_id, .. }
            | WorkerEvent::Final { run_id, .. }
            | WorkerEvent::Error { run_id, .. }
            | WorkerEvent::AgentEnd { run_id } => run_id,
        }
    }

    /// True for frames that end a run's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerEvent::AgentEnd { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_serializes_camel_case() {
        let req = WorkerRequest::Run(RunRequest {
            run_id: "r1".into(),
            session_key: "agent:main:main".into(),
            session_id: None,
            system_prompt: None,
            body_prefix: None,
            body: "hi".into(),
            thinking: ThinkingLevel::High,
            media: Vec::new(),
            model_ref: "claude-sonnet".into(),
            timeout_ms: 120_000,
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "run");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["sessionKey"], "agent:main:main");
        assert_eq!(json["thinking"], "high");
        assert!(json.get("sessionId").is_none());
    }

    #[test]
    fn events_parse_from_worker_lines() {
        let e: WorkerEvent =
            serde_json::from_str(r#"{"type":"text","runId":"r1","delta":"he"}"#).unwrap();
        assert_eq!(
            e,
            WorkerEvent::Text {
                run_id: "r1".into(),
                delta: "he".into()
            }
        );
        let e: WorkerEvent =
            serde_json::from_str(r#"{"type":"session_start","runId":"r1"}"#).unwrap();
        assert_eq!(
            e,
            WorkerEvent::SessionStart {
                run_id: "r1".into(),
                session_id: None
            }
        );
        let e: WorkerEvent = serde_json::from_str(r#"{"type":"agent_end","runId":"r1"}"#).unwrap();
        assert!(e.is_terminal());
    }
}
