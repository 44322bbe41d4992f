//! Model fallback: try the primary model, then each fallback candidate in
//! order, but only when the failure looks like an auth/ratelimit/timeout
//! condition a different model could dodge. Aborts never fall back.

use crate::error::GatewayError;
use std::collections::HashSet;
use std::future::Future;

/// One failed attempt, kept for the aggregate error.
#[derive(Debug, Clone)]
pub struct AttemptError {
    pub model_ref: String,
    pub message: String,
}

/// Candidate ordering and the optional allowlist derived from model aliases.
#[derive(Debug, Clone, Default)]
pub struct FallbackPolicy {
    pub primary: String,
    pub fallbacks: Vec<String>,
    /// When non-empty, fallback candidates not in this set are skipped
    /// (the primary is always attempted).
    pub allowed: HashSet<String>,
}

impl FallbackPolicy {
    /// Ordered candidates: primary first, then allowlisted fallbacks, deduped
    /// by `(provider, model)` key.
    pub fn candidates(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (i, m) in std::iter::once(&self.primary)
            .chain(self.fallbacks.iter())
            .enumerate()
        {
            let m = m.trim();
            if m.is_empty() {
                continue;
            }
            if i > 0 && !self.allowed.is_empty() && !self.allowed.contains(m) {
                continue;
            }
            if seen.insert(provider_model_key(m)) {
                out.push(m.to_string());
            }
        }
        out
    }
}

/// Dedupe key: `provider/model` with the provider defaulting when the ref has
/// no explicit prefix.
fn provider_model_key(model_ref: &str) -> String {
    match model_ref.split_once('/') {
        Some((provider, model)) => format!("{}/{}", provider.trim(), model.trim()),
        None => format!("anthropic/{}", model_ref.trim()),
    }
}

const ERRNO_TOKENS: [&str; 4] = [
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "ECONNRESET",
    "ECONNABORTED",
];

/// Whether this failure justifies trying the next model candidate.
pub fn is_fallback_worthy(message: &str) -> bool {
    let msg = message.trim();
    if msg.is_empty() {
        return false;
    }
    // Abort signals propagate without fallback.
    let lower = msg.to_lowercase();
    if lower.contains("abort") {
        return false;
    }
    for status in ["401", "403", "429"] {
        if msg.contains(status) {
            return true;
        }
    }
    if ERRNO_TOKENS.iter().any(|t| msg.contains(t)) {
        return true;
    }
    ["unauthorized", "forbidden", "rate limit", "ratelimit", "timed out", "timeout", "overloaded"]
        .iter()
        .any(|t| lower.contains(t))
}

/// Run `attempt` for each candidate until one succeeds. A non-fallback-worthy
/// failure is returned immediately; exhaustion yields `FallbackExhausted`
/// enumerating every attempt.
pub async fn run_with_fallback<T, F, Fut>(
    policy: &FallbackPolicy,
    mut attempt: F,
) -> Result<T, GatewayError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let candidates = policy.candidates();
    if candidates.is_empty() {
        return Err(GatewayError::Input("no model configured".to_string()));
    }
    let mut attempts: Vec<AttemptError> = Vec::new();
    let total = candidates.len();
    for model_ref in candidates {
        match attempt(model_ref.clone()).await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let message = e.to_string();
                let worthy = is_fallback_worthy(&message);
                attempts.push(AttemptError {
                    model_ref: model_ref.clone(),
                    message,
                });
                if !worthy {
                    // Last (or only) real error wins when fallback is not justified.
                    return Err(e);
                }
                log::info!(
                    "model {} failed ({}/{} candidates tried), falling back",
                    model_ref,
                    attempts.len(),
                    total
                );
            }
        }
    }
    let summary = attempts
        .iter()
        .map(|a| format!("{}: {}", a.model_ref, a.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(GatewayError::FallbackExhausted(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn classification_matches_policy() {
        assert!(is_fallback_worthy("HTTP 429 too many requests"));
        assert!(is_fallback_worthy("401 unauthorized"));
        assert!(is_fallback_worthy("socket error ECONNRESET"));
        assert!(is_fallback_worthy("request timed out"));
        assert!(!is_fallback_worthy("run aborted by user"));
        assert!(!is_fallback_worthy("invalid prompt"));
    }

    #[test]
    fn candidates_dedupe_by_provider_model() {
        let policy = FallbackPolicy {
            primary: "anthropic/claude-opus".into(),
            fallbacks: vec![
                "claude-opus".into(), // same (provider, model) as primary
                "claude-sonnet".into(),
                "claude-sonnet".into(),
            ],
            allowed: HashSet::new(),
        };
        assert_eq!(
            policy.candidates(),
            vec!["anthropic/claude-opus".to_string(), "claude-sonnet".to_string()]
        );
    }

    #[test]
    fn allowlist_filters_fallbacks_not_primary() {
        let policy = FallbackPolicy {
            primary: "claude-opus".into(),
            fallbacks: vec!["claude-sonnet".into(), "claude-haiku".into()],
            allowed: ["claude-haiku".to_string()].into_iter().collect(),
        };
        assert_eq!(
            policy.candidates(),
            vec!["claude-opus".to_string(), "claude-haiku".to_string()]
        );
    }

    #[tokio::test]
    async fn falls_back_then_aggregates_on_exhaustion() {
        let policy = FallbackPolicy {
            primary: "a".into(),
            fallbacks: vec!["b".into()],
            allowed: HashSet::new(),
        };
        let err = run_with_fallback::<(), _, _>(&policy, |m| async move {
            Err(GatewayError::Agent(format!("{}: HTTP 429", m)))
        })
        .await
        .unwrap_err();
        match err {
            GatewayError::FallbackExhausted(msg) => {
                assert!(msg.contains("a:"));
                assert!(msg.contains("b:"));
            }
            other => panic!("expected FallbackExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_worthy_error_stops_immediately() {
        let policy = FallbackPolicy {
            primary: "a".into(),
            fallbacks: vec!["b".into()],
            allowed: HashSet::new(),
        };
        let calls = AtomicUsize::new(0);
        let err = run_with_fallback::<(), _, _>(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Input("invalid prompt".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Input(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_candidate_can_succeed() {
        let policy = FallbackPolicy {
            primary: "a".into(),
            fallbacks: vec!["b".into()],
            allowed: HashSet::new(),
        };
        let out = run_with_fallback(&policy, |m| async move {
            if m == "b" {
                Ok(m)
            } else {
                Err(GatewayError::Agent("HTTP 403".into()))
            }
        })
        .await
        .unwrap();
        assert_eq!(out, "b");
    }
}
