//! Heartbeat scheduler: periodic per-channel probes through the session
//! scheduler as forced-sync admissions, with visibility filtering on the
//! response. Heartbeats never mutate the session's last route and never
//! regress `updatedAt`.

use crate::config::{self, HeartbeatConfig};
use crate::envelope::Channel;
use crate::outbound;
use crate::pipeline::PipelineContext;
use crate::scheduler::{DeliveryRoute, PromptRequest, RunOrigin, RunOutcome, Scheduler};
use crate::session::QueueMode;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const HEARTBEAT_PROMPT: &str = "HEARTBEAT";
const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

pub struct HeartbeatRunner {
    ctx: Arc<PipelineContext>,
    scheduler: Scheduler,
}

impl HeartbeatRunner {
    pub fn new(ctx: Arc<PipelineContext>, scheduler: Scheduler) -> Self {
        Self { ctx, scheduler }
    }

    /// Spawn one loop per configured channel. Loops re-read the config every
    /// tick, so interval changes apply without restart.
    pub fn start(self: Arc<Self>) {
        let runner = self.clone();
        tokio::spawn(async move {
            let cfg = runner.ctx.config.get().await;
            for name in cfg.heartbeat.keys().cloned() {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner.channel_loop(name).await;
                });
            }
        });
    }

    async fn channel_loop(self: Arc<Self>, channel_name: String) {
        loop {
            let cfg = self.ctx.config.get().await;
            let Some(hb) = cfg.heartbeat.get(&channel_name).cloned() else {
                return;
            };
            let Some(every) = hb.every.as_deref().and_then(config::parse_interval) else {
                return;
            };
            tokio::time::sleep(every).await;
            if let Err(e) = self.run_once(&channel_name, &hb).await {
                log::debug!("heartbeat {} skipped: {}", channel_name, e);
            }
        }
    }

    /// One probe: resolve the target, check link state and visibility, run
    /// the forced prompt, filter and deliver the response.
    pub async fn run_once(&self, channel_name: &str, hb: &HeartbeatConfig) -> Result<()> {
        let cfg = self.ctx.config.get().await;
        let session_key = format!("agent:{}:main", cfg.session.agent_id);
        let session = self.ctx.sessions.get(&session_key).await;

        let Some(route) = resolve_route(hb, &session) else {
            log::debug!("heartbeat {}: no delivery target", channel_name);
            return Ok(());
        };

        // Provider must be linked (for WhatsApp: web auth + active listener).
        if let Some(handle) = self.ctx.registry.get(route.channel).await {
            if !handle.is_linked() {
                log::debug!("heartbeat {}: provider not linked", channel_name);
                return Ok(());
            }
        } else {
            log::debug!("heartbeat {}: provider not running", channel_name);
            return Ok(());
        }

        let v = &hb.visibility;
        if !v.show_alerts && !v.show_ok && !v.use_indicator {
            log::debug!("heartbeat {}: all outputs disabled", channel_name);
            return Ok(());
        }

        let (result_tx, mut result_rx) = mpsc::channel(1);
        let mut request = PromptRequest::user(&session_key, HEARTBEAT_PROMPT);
        request.origin = RunOrigin::Heartbeat;
        request.forced = true;
        // The runner delivers the filtered response itself.
        request.deliver = false;
        request.thinking = hb.think;
        request.queue_mode = QueueMode::Queue;
        request.result_tx = Some(result_tx);
        self.scheduler.submit(request).await;

        let timeout = Duration::from_millis(cfg.agent.run_timeout_ms) + Duration::from_secs(30);
        let outcome = match tokio::time::timeout(timeout, result_rx.recv()).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => {
                log::debug!("heartbeat {}: no outcome", channel_name);
                return Ok(());
            }
        };

        let text = match outcome {
            RunOutcome::Final { text } => text,
            RunOutcome::Cancelled => return Ok(()),
            RunOutcome::Failed { message } => {
                log::warn!("heartbeat {} run failed: {}", channel_name, message);
                return Ok(());
            }
        };

        let Some(payload) = filter_response(&text, hb) else {
            log::debug!("heartbeat {}: response suppressed by visibility", channel_name);
            return Ok(());
        };

        if let Some(handle) = self.ctx.registry.get(route.channel).await {
            let opts = crate::channels::SendOptions {
                account_id: route.account_id.clone(),
            };
            for chunk in outbound::chunk_text(&payload, outbound::DEFAULT_MAX_CHUNK_CHARS) {
                if let Err(e) = handle.send_message(&route.to, &chunk, &opts).await {
                    log::warn!("heartbeat send to {} failed: {}", route.channel, e);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Target resolution: explicit target/to override, else the main session's
/// last route. `None` means nothing to reply to.
fn resolve_route(hb: &HeartbeatConfig, session: &crate::session::Session) -> Option<DeliveryRoute> {
    let channel = match hb.target.as_deref() {
        Some(t) => Channel::parse(t)?,
        None => session.last_channel?,
    };
    let to = match &hb.to {
        Some(to) => to.clone(),
        None => session.last_to.clone()?,
    };
    Some(DeliveryRoute {
        channel,
        to,
        account_id: hb.account_id.clone(),
    })
}

/// Apply visibility rules to the probe response. Returns the payload to send,
/// or `None` when it must be suppressed.
fn filter_response(text: &str, hb: &HeartbeatConfig) -> Option<String> {
    let plain = outbound::strip_markup(&outbound::strip_think_segments(text));
    let collapsed = collapse_ok_tails(plain.trim());
    if collapsed.is_empty() {
        return None;
    }
    let is_ok = collapsed.contains(HEARTBEAT_OK);
    if is_ok && !hb.visibility.show_ok {
        return None;
    }
    if !is_ok && !hb.visibility.show_alerts {
        return None;
    }
    let capped = if hb.ack_max_chars > 0 {
        collapsed.chars().take(hb.ack_max_chars).collect()
    } else {
        collapsed
    };
    Some(capped)
}

/// Collapse repeated HEARTBEAT_OK tails into a single occurrence.
fn collapse_ok_tails(text: &str) -> String {
    let mut out = text.trim_end().to_string();
    loop {
        let trimmed = out.trim_end();
        let Some(stripped) = trimmed.strip_suffix(HEARTBEAT_OK) else {
            break;
        };
        let rest = stripped.trim_end();
        if rest.ends_with(HEARTBEAT_OK) {
            out = rest.to_string();
        } else {
            break;
        }
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConfig, HeartbeatVisibility};
    use crate::session::Session;

    fn hb(show_ok: bool, show_alerts: bool) -> HeartbeatConfig {
        HeartbeatConfig {
            every: Some("5m".into()),
            target: None,
            to: None,
            account_id: None,
            think: None,
            ack_max_chars: 0,
            visibility: HeartbeatVisibility {
                show_ok,
                show_alerts,
                use_indicator: false,
            },
        }
    }

    #[test]
    fn ok_responses_are_suppressed_unless_shown() {
        assert_eq!(filter_response("<b>HEARTBEAT_OK</b>", &hb(false, true)), None);
        assert_eq!(
            filter_response("<b>HEARTBEAT_OK</b>", &hb(true, true)),
            Some("HEARTBEAT_OK".to_string())
        );
    }

    #[test]
    fn alerts_follow_show_alerts() {
        assert_eq!(
            filter_response("disk almost full", &hb(false, true)),
            Some("disk almost full".to_string())
        );
        assert_eq!(filter_response("disk almost full", &hb(false, false)), None);
    }

    #[test]
    fn repeated_ok_tails_collapse() {
        let text = "HEARTBEAT_OK HEARTBEAT_OK HEARTBEAT_OK";
        assert_eq!(collapse_ok_tails(text), "HEARTBEAT_OK");
        assert_eq!(
            filter_response(text, &hb(true, true)),
            Some("HEARTBEAT_OK".to_string())
        );
        // Non-repeated content is untouched.
        assert_eq!(collapse_ok_tails("all good"), "all good");
    }

    #[test]
    fn ack_cap_applies_when_nonzero() {
        let mut cfg = hb(false, true);
        cfg.ack_max_chars = 4;
        assert_eq!(
            filter_response("alert text", &cfg),
            Some("aler".to_string())
        );
        cfg.ack_max_chars = 0;
        assert_eq!(
            filter_response("alert text", &cfg),
            Some("alert text".to_string())
        );
    }

    #[test]
    fn route_prefers_override_then_last() {
        let mut session = Session::default();
        assert_eq!(resolve_route(&hb(true, true), &session), None);

        session.last_channel = Some(Channel::Whatsapp);
        session.last_to = Some("+491701".into());
        let r = resolve_route(&hb(true, true), &session).unwrap();
        assert_eq!(r.channel, Channel::Whatsapp);
        assert_eq!(r.to, "+491701");

        let mut cfg = hb(true, true);
        cfg.target = Some("telegram".into());
        cfg.to = Some("chat-9".into());
        cfg.account_id = Some("work".into());
        let r = resolve_route(&cfg, &session).unwrap();
        assert_eq!(r.channel, Channel::Telegram);
        assert_eq!(r.to, "chat-9");
        assert_eq!(r.account_id.as_deref(), Some("work"));
    }
}
