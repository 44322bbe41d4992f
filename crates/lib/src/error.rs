//! Gateway error taxonomy. Each variant maps to a stable wire code used by the
//! control-plane protocol and the node bridge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad request: invalid directive level, malformed JSON, missing field. Not retried.
    #[error("{0}")]
    Input(String),

    /// Allowlist rejection, unknown pairing token, loopback-only violation.
    #[error("{0}")]
    Auth(String),

    /// Provider not linked, socket dropped. Retried with backoff; heartbeat treats it as a skip.
    #[error("{0}")]
    Transport(String),

    /// Agent worker crash or error frame. The run is marked failed.
    #[error("{0}")]
    Agent(String),

    /// Run or invoke deadline exceeded.
    #[error("{0}")]
    Timeout(String),

    /// All model candidates failed; message enumerates each attempt.
    #[error("all model candidates failed: {0}")]
    FallbackExhausted(String),

    /// Corrupted state store, schema mismatch, port bind conflict. The gateway exits non-zero.
    #[error("{0}")]
    Fatal(String),
}

impl GatewayError {
    /// Stable wire code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Input(_) => "INVALID_REQUEST",
            GatewayError::Auth(_) => "UNAUTHORIZED",
            GatewayError::Transport(_) => "UNAVAILABLE",
            GatewayError::Agent(_) => "AGENT_ERROR",
            GatewayError::Timeout(_) => "TIMEOUT",
            GatewayError::FallbackExhausted(_) => "FALLBACK_EXHAUSTED",
            GatewayError::Fatal(_) => "FATAL",
        }
    }

    /// One-line summary safe for user-visible surfaces (no internal payloads).
    pub fn user_summary(&self) -> String {
        match self {
            GatewayError::Input(m) => m.clone(),
            GatewayError::Auth(_) => "not authorized".to_string(),
            GatewayError::Transport(_) => "provider unavailable".to_string(),
            GatewayError::Agent(_) => "agent failed".to_string(),
            GatewayError::Timeout(_) => "agent timed out".to_string(),
            GatewayError::FallbackExhausted(_) => "agent failed (all models)".to_string(),
            GatewayError::Fatal(m) => m.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
