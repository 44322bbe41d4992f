//! Inbound event pipeline and run execution.
//!
//! Every transport feeds envelopes into [`Pipeline::handle_envelope`]:
//! dedupe → authorization → stop words → directives → session routing →
//! scheduler admission. The [`AgentExecutor`] carries a run end to end:
//! worker invocation with model fallback, event pumping (streaming to the
//! control plane, verbose tool lines to the transport), and final delivery.

use crate::agent::{
    run_with_fallback, AgentWorker, FallbackPolicy, RunRequest, WorkerEvent,
};
use crate::authz::{self, Decision};
use crate::channels::{ChannelRegistry, SendOptions};
use crate::config::{self, ConfigHandle};
use crate::directives::{self, Directive, Parsed, QueueDirective};
use crate::envelope::{Channel, ChatType, Envelope};
use crate::error::GatewayError;
use crate::outbound;
use crate::scheduler::{
    DeliveryRoute, PromptRequest, RunContext, RunExecutor, RunOrigin, RunOutcome, Scheduler,
};
use crate::session::{self, QueueMode, SessionStore, ThinkingLevel, TranscriptEntry, VerboseMode};
use crate::store;
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

const DEDUPE_WINDOW: usize = 512;
const ABORT_REMINDER: &str =
    "Note: the previous run was aborted by the user before it finished.";

/// Assumed context window for the `/status` percentage.
const CONTEXT_WINDOW_TOKENS: u64 = 200_000;

/// Shared services threaded through the pipeline and executor; tests build
/// their own with fakes.
pub struct PipelineContext {
    pub config: ConfigHandle,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<ChannelRegistry>,
    pub worker: AgentWorker,
    /// Serialized control-plane event frames.
    pub event_tx: broadcast::Sender<String>,
}

/// The inbound pipeline. Owns dedupe state and submits to the scheduler.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    scheduler: Scheduler,
    seen: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl Pipeline {
    pub fn new(ctx: Arc<PipelineContext>, scheduler: Scheduler) -> Self {
        Self {
            ctx,
            scheduler,
            seen: Mutex::new((VecDeque::new(), HashSet::new())),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Spawn the pipeline loop over an envelope channel.
    pub fn start(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Envelope>) {
        tokio::spawn(async move {
            while let Some(envelope) = inbound_rx.recv().await {
                self.handle_envelope(envelope).await;
            }
            log::debug!("inbound pipeline stopped");
        });
    }

    /// Process one normalized inbound message.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        if self.is_duplicate(&envelope).await {
            log::debug!("duplicate message {} dropped", envelope.message_id);
            return;
        }
        let cfg = self.ctx.config.get().await;
        let channel_cfg = config::channel_config(&cfg, envelope.channel).clone();
        let key = session::session_key(
            &cfg.session.agent_id,
            envelope.channel,
            envelope.chat_type,
            &envelope.chat_key,
            cfg.session.collapse_direct_to_main,
        );
        let session = self.ctx.sessions.get(&key).await;

        match authz::authorize(&envelope, &channel_cfg, &session, &channel_cfg.bot_ids) {
            Decision::Deny => {
                log::info!(
                    "unauthorized {} message from {} dropped",
                    envelope.channel,
                    envelope.from
                );
                return;
            }
            Decision::Allow { mention_only } => {
                if mention_only {
                    log::info!("mention-only turn admitted for {}", envelope.chat_key);
                }
            }
        }

        let route = DeliveryRoute {
            channel: envelope.channel,
            to: envelope.chat_key.clone(),
            account_id: envelope.account_id.clone(),
        };

        // Stop words and directives act before any scheduling.
        let (body, thinking_override, verbose_override) =
            match directives::parse(&envelope.body) {
                Parsed::Stop => {
                    if let Err(e) = self
                        .ctx
                        .sessions
                        .update(&key, |s| s.aborted = true)
                        .await
                    {
                        log::warn!("session store write failed: {}", e);
                    }
                    self.reply(&route, "Agent was aborted.").await;
                    return;
                }
                Parsed::Invalid { hint } => {
                    self.reply(&route, &hint).await;
                    return;
                }
                Parsed::Directive(directive) => {
                    match self
                        .apply_directive(&key, &envelope, &route, directive, &cfg)
                        .await
                    {
                        Some(inline) => inline,
                        None => return, // directive-only; confirmation already sent
                    }
                }
                Parsed::None => (envelope.body.clone(), None, None),
            };

        // Route bookkeeping for "reply to last" targets. Heartbeats never come
        // through here, and display-only node events must not steal the route.
        if envelope.deliver {
            if let Err(e) = self
                .ctx
                .sessions
                .update_quiet(&key, |s| {
                    s.last_channel = Some(envelope.channel);
                    s.last_provider = Some(envelope.provider.clone());
                    s.last_to = Some(envelope.chat_key.clone());
                })
                .await
            {
                log::warn!("session store write failed: {}", e);
            }
        }

        let queue_mode = resolve_queue_mode(&cfg, &channel_cfg, &session, envelope.channel);
        let mut request = PromptRequest::user(&key, &body);
        request.chat_type = envelope.chat_type;
        request.from = Some(envelope.from.clone());
        request.origin = RunOrigin::User;
        request.deliver = envelope.deliver;
        request.route = Some(route);
        request.thinking = thinking_override;
        request.verbose = verbose_override;
        request.media = envelope.media.clone();
        request.queue_mode = queue_mode;
        self.scheduler.submit(request).await;
    }

    async fn is_duplicate(&self, envelope: &Envelope) -> bool {
        let id = format!("{}:{}", envelope.channel, envelope.message_id);
        let mut g = self.seen.lock().await;
        if g.1.contains(&id) {
            return true;
        }
        g.0.push_back(id.clone());
        g.1.insert(id);
        if g.0.len() > DEDUPE_WINDOW {
            if let Some(old) = g.0.pop_front() {
                g.1.remove(&old);
            }
        }
        false
    }

    /// Apply a directive. Returns `Some((body, thinking, verbose))` when an
    /// inline remainder should still run this turn, `None` when the message
    /// was directive-only.
    async fn apply_directive(
        &self,
        key: &str,
        envelope: &Envelope,
        route: &DeliveryRoute,
        directive: Directive,
        cfg: &config::Config,
    ) -> Option<(String, Option<ThinkingLevel>, Option<VerboseMode>)> {
        match directive {
            Directive::Think { level, rest } => match rest {
                Some(body) => Some((body, Some(level), None)),
                None => {
                    self.update_session(key, |s| s.thinking_level = level).await;
                    self.reply(
                        route,
                        &directives::confirmation(&Directive::Think { level, rest: None }),
                    )
                    .await;
                    None
                }
            },
            Directive::Verbose { mode, rest } => match rest {
                Some(body) => Some((body, None, Some(mode))),
                None => {
                    self.update_session(key, |s| s.verbose = mode).await;
                    self.reply(
                        route,
                        &directives::confirmation(&Directive::Verbose { mode, rest: None }),
                    )
                    .await;
                    None
                }
            },
            Directive::Queue(q) => {
                let value = match q {
                    QueueDirective::Mode(m) => Some(m),
                    QueueDirective::Reset => None,
                };
                self.update_session(key, |s| s.queue_mode = value).await;
                self.reply(route, &directives::confirmation(&Directive::Queue(q)))
                    .await;
                None
            }
            Directive::New => {
                self.update_session(key, |s| {
                    s.session_id = None;
                    s.primed = false;
                })
                .await;
                self.reply(route, &directives::confirmation(&Directive::New))
                    .await;
                None
            }
            Directive::Model(model_ref) => {
                if !model_allowed(cfg, &model_ref) {
                    let allowed = allowed_model_refs(cfg).join(", ");
                    self.reply(
                        route,
                        &format!("Unknown model: {}. Available: {}", model_ref, allowed),
                    )
                    .await;
                    return None;
                }
                let resolved = cfg
                    .agent
                    .model_aliases
                    .get(&model_ref)
                    .cloned()
                    .unwrap_or_else(|| model_ref.clone());
                self.update_session(key, |s| s.model_override = Some(resolved))
                    .await;
                self.reply(
                    route,
                    &directives::confirmation(&Directive::Model(model_ref)),
                )
                .await;
                None
            }
            Directive::Status => {
                let text = self.status_text(key).await;
                self.reply(route, &text).await;
                None
            }
            Directive::Restart => {
                if !authz::is_admin(&cfg.admin, &envelope.from) {
                    self.reply(route, "Restart is limited to admins.").await;
                    return None;
                }
                self.reply(route, "Restarting gateway.").await;
                let frame = json!({ "event": "restart", "payload": {} });
                if let Ok(line) = serde_json::to_string(&frame) {
                    let _ = self.ctx.event_tx.send(line);
                }
                None
            }
        }
    }

    async fn status_text(&self, key: &str) -> String {
        let session = self.ctx.sessions.get(key).await;
        let cfg = self.ctx.config.get().await;
        let model = session
            .model_override
            .clone()
            .unwrap_or_else(|| config::resolve_model(&cfg).primary);
        let context_pct = session
            .context_used
            .map(|used| format!("{:.0}%", (used as f64 / CONTEXT_WINDOW_TOKENS as f64) * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        let whatsapp = self.ctx.registry.get(Channel::Whatsapp).await;
        let creds = whatsapp
            .and_then(|h| h.last_linked_at_ms())
            .map(|ms| {
                chrono::DateTime::from_timestamp_millis(ms)
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| ms.to_string())
            })
            .unwrap_or_else(|| "never".to_string());
        format!(
            "Session {}\nmodel: {}\nthinking: {} | verbose: {}\ncontext: {}\nruns in flight: {}\nwhatsapp creds refresh: {}",
            key,
            model,
            session.thinking_level.as_str(),
            session.verbose.as_str(),
            context_pct,
            self.scheduler.in_flight(),
            creds,
        )
    }

    async fn update_session<F: FnOnce(&mut session::Session)>(&self, key: &str, f: F) {
        if let Err(e) = self.ctx.sessions.update(key, f).await {
            log::warn!("session store write failed: {}", e);
        }
    }

    /// Send a short reply (confirmations, hints) straight to the transport.
    async fn reply(&self, route: &DeliveryRoute, text: &str) {
        deliver_text(&self.ctx, route, text).await;
    }
}

/// Queue-mode resolution: session override > channel config > global config >
/// built-in channel default.
fn resolve_queue_mode(
    cfg: &config::Config,
    channel_cfg: &config::ChannelConfig,
    session: &session::Session,
    channel: Channel,
) -> QueueMode {
    session
        .queue_mode
        .or(channel_cfg.queue_mode)
        .or(cfg.agent.queue_mode)
        .unwrap_or_else(|| config::channel_default_queue_mode(channel))
}

fn allowed_model_refs(cfg: &config::Config) -> Vec<String> {
    let selection = config::resolve_model(cfg);
    let mut out: Vec<String> = cfg.agent.model_aliases.keys().cloned().collect();
    out.sort();
    out.insert(0, selection.primary);
    out.extend(selection.fallbacks);
    out
}

fn model_allowed(cfg: &config::Config, model_ref: &str) -> bool {
    let selection = config::resolve_model(cfg);
    model_ref == selection.primary
        || selection.fallbacks.iter().any(|m| m == model_ref)
        || cfg.agent.model_aliases.contains_key(model_ref)
        || cfg.agent.model_aliases.values().any(|v| v == model_ref)
}

/// Oversized images are dropped before the prompt reaches the agent backend;
/// other media kinds pass through.
fn clamp_agent_media(
    media: &[crate::envelope::MediaAttachment],
) -> Vec<crate::envelope::MediaAttachment> {
    media
        .iter()
        .filter(|m| {
            let keep = m.kind != crate::envelope::MediaKind::Image
                || m.size_bytes <= outbound::AGENT_IMAGE_CAP_BYTES;
            if !keep {
                log::info!("dropping oversized image ({} bytes) from prompt", m.size_bytes);
            }
            keep
        })
        .cloned()
        .collect()
}

/// Deliver media to a transport, degrading to caption-only text with a
/// trailing warning when the payload is over the per-kind cap or the send
/// fails.
pub async fn deliver_media(
    ctx: &PipelineContext,
    route: &DeliveryRoute,
    media: &crate::envelope::MediaAttachment,
    caption: Option<&str>,
) -> Result<(), String> {
    let Some(handle) = ctx.registry.get(route.channel).await else {
        return Err(format!("no channel handle for {}", route.channel));
    };
    let opts = SendOptions {
        account_id: route.account_id.clone(),
    };
    handle.send_typing(&route.to, &opts).await;
    let send_result = if outbound::media_within_cap(media.kind, media.size_bytes) {
        handle.send_media(&route.to, media, caption, &opts).await
    } else {
        Err(format!(
            "media over cap ({} bytes)",
            media.size_bytes
        ))
    };
    match send_result {
        Ok(()) => Ok(()),
        Err(e) => {
            log::warn!("media send to {} failed: {}", route.channel, e);
            let fallback = match caption {
                Some(c) if !c.trim().is_empty() => {
                    format!("{}\n{}", c.trim(), outbound::MEDIA_FAILED_WARNING)
                }
                _ => outbound::MEDIA_FAILED_WARNING.to_string(),
            };
            handle.send_message(&route.to, &fallback, &opts).await
        }
    }
}

/// Deliver text to a transport: think-strip, chunk at the channel cap, raise
/// the typing indicator, send each chunk.
async fn deliver_text(ctx: &PipelineContext, route: &DeliveryRoute, text: &str) {
    let cleaned = outbound::strip_think_segments(text);
    if cleaned.is_empty() {
        return;
    }
    let Some(handle) = ctx.registry.get(route.channel).await else {
        log::warn!("no channel handle for {}", route.channel);
        return;
    };
    let cfg = ctx.config.get().await;
    let max = config::channel_config(&cfg, route.channel)
        .max_chunk_chars
        .unwrap_or(outbound::DEFAULT_MAX_CHUNK_CHARS);
    let opts = SendOptions {
        account_id: route.account_id.clone(),
    };
    handle.send_typing(&route.to, &opts).await;
    for chunk in outbound::chunk_text(&cleaned, max) {
        if let Err(e) = handle.send_message(&route.to, &chunk, &opts).await {
            log::warn!("send to {} failed: {}", route.channel, e);
            return;
        }
    }
}

/// Executes runs for the scheduler: agent invocation with fallback, event
/// pumping, and delivery.
pub struct AgentExecutor {
    ctx: Arc<PipelineContext>,
}

impl AgentExecutor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn emit_chat_event(&self, run_id: &str, state: &str, payload: serde_json::Value) {
        let mut body = json!({ "runId": run_id, "state": state });
        if let Some(obj) = body.as_object_mut() {
            if let Some(extra) = payload.as_object() {
                for (k, v) in extra {
                    obj.insert(k.clone(), v.clone());
                }
            }
        }
        let frame = json!({ "event": "chat", "payload": body });
        if let Ok(line) = serde_json::to_string(&frame) {
            let _ = self.ctx.event_tx.send(line);
        }
    }
}

#[async_trait]
impl RunExecutor for AgentExecutor {
    async fn execute(&self, sched_ctx: RunContext) -> RunOutcome {
        let request = sched_ctx.request.clone();
        let cfg = self.ctx.config.get().await;
        let session = self.ctx.sessions.get(&request.session_key).await;

        // Abort reminder: consumed by the next prompt, then cleared.
        let mut prefix_parts: Vec<String> = Vec::new();
        if session.aborted {
            prefix_parts.push(ABORT_REMINDER.to_string());
            if let Err(e) = self
                .ctx
                .sessions
                .update_quiet(&request.session_key, |s| s.aborted = false)
                .await
            {
                log::warn!("session store write failed: {}", e);
            }
        }
        if let Some(p) = &request.body_prefix {
            prefix_parts.push(p.clone());
        }
        // Group primer goes out once per session on its first turn. Channel
        // chats (Discord guilds) are multi-party too and get it as well.
        let needs_primer = request.chat_type != ChatType::Direct && !session.primed;
        if needs_primer {
            prefix_parts.push(format!(
                "You are replying inside the group conversation {}. Address the group, not an individual.",
                request.route.as_ref().map(|r| r.to.as_str()).unwrap_or("?")
            ));
        }
        let body_prefix = if prefix_parts.is_empty() {
            None
        } else {
            Some(prefix_parts.join("\n"))
        };

        let thinking = request.thinking.unwrap_or(session.thinking_level);
        let verbose = request.verbose.unwrap_or(session.verbose);

        let selection = config::resolve_model(&cfg);
        let policy = FallbackPolicy {
            primary: session
                .model_override
                .clone()
                .unwrap_or(selection.primary),
            fallbacks: selection.fallbacks,
            allowed: cfg.agent.model_aliases.values().cloned().collect(),
        };

        if let Err(e) = self
            .ctx
            .sessions
            .append_transcript(
                &request.session_key,
                &TranscriptEntry {
                    role: "user".into(),
                    content: request.body.clone(),
                    at_ms: store::now_ms(),
                    run_id: Some(sched_ctx.run_id.clone()),
                },
            )
            .await
        {
            log::warn!("transcript append failed: {}", e);
        }

        let timeout_ms = cfg.agent.run_timeout_ms.min(cfg.agent.hard_timeout_ms);

        // Each fallback attempt is a full run: admission plus event pump. A
        // failed pump with a fallback-worthy message moves to the next
        // candidate; cancel and timeout resolve without fallback.
        let sched_ctx_ref = &sched_ctx;
        let request_ref = &request;
        let session_id = session.session_id.clone();
        let session_id_ref = &session_id;
        let body_prefix_ref = &body_prefix;
        let attempt_result = run_with_fallback(&policy, |model_ref| async move {
            let rx = self
                .ctx
                .worker
                .run(RunRequest {
                    run_id: sched_ctx_ref.run_id.clone(),
                    session_key: request_ref.session_key.clone(),
                    session_id: session_id_ref.clone(),
                    system_prompt: None,
                    body_prefix: body_prefix_ref.clone(),
                    body: request_ref.body.clone(),
                    thinking,
                    media: clamp_agent_media(&request_ref.media),
                    model_ref,
                    timeout_ms,
                })
                .await
                .map_err(|e| GatewayError::Agent(e.to_string()))?;
            let cancel = sched_ctx_ref.cancel.clone();
            let (end, usage, text) = self
                .pump_events(sched_ctx_ref, request_ref, rx, cancel, verbose)
                .await;
            match end {
                RunPumpEnd::Failed(message) => Err(GatewayError::Agent(message)),
                other => Ok((other, usage, text)),
            }
        })
        .await;

        let (end, usage, text) = match attempt_result {
            Ok(v) => v,
            Err(e) => (RunPumpEnd::Failed(e.user_summary()), None, String::new()),
        };
        self.finish(&sched_ctx, &request, end.clone(), usage, text.clone())
            .await;
        match end {
            RunPumpEnd::Final => RunOutcome::Final { text },
            RunPumpEnd::Cancelled => RunOutcome::Cancelled,
            RunPumpEnd::Timeout => RunOutcome::Failed {
                message: "agent timed out".into(),
            },
            RunPumpEnd::Failed(message) => RunOutcome::Failed { message },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RunPumpEnd {
    Final,
    Cancelled,
    Timeout,
    Failed(String),
}

impl AgentExecutor {
    /// Drive one run's event stream to completion.
    async fn pump_events(
        &self,
        sched_ctx: &RunContext,
        request: &PromptRequest,
        mut events: mpsc::Receiver<WorkerEvent>,
        mut cancel: tokio::sync::watch::Receiver<u64>,
        verbose: VerboseMode,
    ) -> (RunPumpEnd, Option<u64>, String) {
        let cfg = self.ctx.config.get().await;
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(cfg.agent.run_timeout_ms.min(cfg.agent.hard_timeout_ms));
        let mut coalescer = outbound::ToolCoalescer::new(verbose == VerboseMode::Full);
        let mut streamed = String::new();
        let mut final_text: Option<String> = None;
        let mut context_used: Option<u64> = None;
        let mut failed: Option<String> = None;
        let mut cancelled = false;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        // Stream closed without agent_end: treat as resolved.
                        break;
                    };
                    match event {
                        WorkerEvent::SessionStart { session_id, .. } => {
                            if let Some(id) = session_id {
                                let key = request.session_key.clone();
                                if let Err(e) = self
                                    .ctx
                                    .sessions
                                    .update_quiet(&key, |s| {
                                        if s.session_id.is_none() {
                                            s.session_id = Some(id.clone());
                                        }
                                    })
                                    .await
                                {
                                    log::warn!("session store write failed: {}", e);
                                }
                            }
                        }
                        WorkerEvent::Text { delta, .. } => {
                            sched_ctx.mark_streaming().await;
                            streamed.push_str(&delta);
                            // Streaming deltas reach control-plane subscribers
                            // only; transports get the final payload.
                            self.emit_chat_event(
                                &sched_ctx.run_id,
                                "streaming",
                                json!({ "text": delta }),
                            );
                        }
                        WorkerEvent::ToolStart { tool, arg, .. } => {
                            self.emit_chat_event(
                                &sched_ctx.run_id,
                                "streaming",
                                json!({ "toolEvent": { "tool": tool, "phase": "start" } }),
                            );
                            if verbose != VerboseMode::Off {
                                if let Some(line) = coalescer.tool_start(&tool, arg.as_deref()) {
                                    self.send_meta(request, &line).await;
                                }
                            }
                        }
                        WorkerEvent::ToolEnd { tool, preview, .. } => {
                            self.emit_chat_event(
                                &sched_ctx.run_id,
                                "streaming",
                                json!({ "toolEvent": { "tool": tool, "phase": "end" } }),
                            );
                            if verbose != VerboseMode::Off {
                                if let Some(line) = coalescer.tool_end(&tool, preview.as_deref()) {
                                    self.send_meta(request, &line).await;
                                }
                            }
                        }
                        WorkerEvent::Final { text, usage, .. } => {
                            if let Some(u) = usage.as_ref().and_then(|u| u.context_used) {
                                context_used = Some(u);
                            }
                            final_text = Some(text);
                        }
                        WorkerEvent::Error { message, .. } => {
                            failed = Some(message);
                        }
                        WorkerEvent::AgentEnd { .. } => break,
                    }
                }
                _ = cancel.changed() => {
                    cancelled = true;
                    self.ctx.worker.cancel(&sched_ctx.run_id).await;
                    // Keep draining until the worker resolves the run.
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.ctx.worker.cancel(&sched_ctx.run_id).await;
                    if verbose != VerboseMode::Off {
                        if let Some(line) = coalescer.flush() {
                            self.send_meta(request, &line).await;
                        }
                    }
                    return (RunPumpEnd::Timeout, context_used, streamed);
                }
            }
        }

        if verbose != VerboseMode::Off {
            if let Some(line) = coalescer.flush() {
                self.send_meta(request, &line).await;
            }
        }

        if cancelled {
            return (RunPumpEnd::Cancelled, context_used, streamed);
        }
        if let Some(message) = failed {
            return (RunPumpEnd::Failed(message), context_used, streamed);
        }
        match final_text {
            Some(text) => (RunPumpEnd::Final, context_used, text),
            // agent_end without final: deliver what streamed.
            None => (RunPumpEnd::Final, context_used, streamed),
        }
    }

    /// Verbose tool metadata lines go straight to the transport.
    async fn send_meta(&self, request: &PromptRequest, line: &str) {
        if !request.deliver || request.origin == RunOrigin::Heartbeat {
            return;
        }
        if let Some(route) = &request.route {
            deliver_text(&self.ctx, route, line).await;
        }
    }

    /// Terminal bookkeeping: session updates, transcript, delivery, events.
    async fn finish(
        &self,
        sched_ctx: &RunContext,
        request: &PromptRequest,
        end: RunPumpEnd,
        context_used: Option<u64>,
        text: String,
    ) {
        match &end {
            RunPumpEnd::Final => {
                // Only a successful final advances updatedAt.
                if let Err(e) = self
                    .ctx
                    .sessions
                    .update(&request.session_key, |s| {
                        if let Some(u) = context_used {
                            s.context_used = Some(u);
                        }
                        if request.chat_type != ChatType::Direct {
                            s.primed = true;
                        }
                    })
                    .await
                {
                    log::warn!("session store write failed: {}", e);
                }
                if let Err(e) = self
                    .ctx
                    .sessions
                    .append_transcript(
                        &request.session_key,
                        &TranscriptEntry {
                            role: "assistant".into(),
                            content: text.clone(),
                            at_ms: store::now_ms(),
                            run_id: Some(sched_ctx.run_id.clone()),
                        },
                    )
                    .await
                {
                    log::warn!("transcript append failed: {}", e);
                }
                if request.deliver && request.origin != RunOrigin::Heartbeat {
                    if let Some(route) = &request.route {
                        deliver_text(&self.ctx, route, &text).await;
                    }
                }
                self.emit_chat_event(&sched_ctx.run_id, "final", json!({ "text": text }));
            }
            RunPumpEnd::Cancelled => {
                self.emit_chat_event(&sched_ctx.run_id, "cancelled", json!({}));
            }
            RunPumpEnd::Timeout => {
                // The sole path where partial text reaches a transport.
                if request.origin == RunOrigin::User && request.deliver && !text.is_empty() {
                    if let Some(route) = &request.route {
                        let partial = outbound::timeout_partial(&text, 0);
                        deliver_text(&self.ctx, route, &partial).await;
                    }
                }
                self.emit_chat_event(&sched_ctx.run_id, "failed", json!({ "error": "timeout" }));
            }
            RunPumpEnd::Failed(message) => {
                log::warn!("run {} failed: {}", sched_ctx.run_id, message);
                if request.origin == RunOrigin::User && request.deliver {
                    if let Some(route) = &request.route {
                        deliver_text(&self.ctx, route, "Agent failed. Check the gateway logs.")
                            .await;
                    }
                }
                self.emit_chat_event(
                    &sched_ctx.run_id,
                    "failed",
                    json!({ "error": "agent failed" }),
                );
            }
        }
        if let Some(result_tx) = &request.result_tx {
            let outcome = match end {
                RunPumpEnd::Final => RunOutcome::Final { text },
                RunPumpEnd::Cancelled => RunOutcome::Cancelled,
                RunPumpEnd::Timeout => RunOutcome::Failed {
                    message: "timeout".into(),
                },
                RunPumpEnd::Failed(message) => RunOutcome::Failed { message },
            };
            let _ = result_tx.send(outcome).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn queue_mode_resolution_order() {
        let mut cfg = Config::default();
        let mut channel_cfg = config::ChannelConfig::default();
        let mut session = session::Session::default();

        // Built-in default.
        assert_eq!(
            resolve_queue_mode(&cfg, &channel_cfg, &session, Channel::Whatsapp),
            QueueMode::Interrupt
        );
        assert_eq!(
            resolve_queue_mode(&cfg, &channel_cfg, &session, Channel::Discord),
            QueueMode::Queue
        );
        // Global config beats built-in.
        cfg.agent.queue_mode = Some(QueueMode::Queue);
        assert_eq!(
            resolve_queue_mode(&cfg, &channel_cfg, &session, Channel::Whatsapp),
            QueueMode::Queue
        );
        // Channel config beats global.
        channel_cfg.queue_mode = Some(QueueMode::Interrupt);
        assert_eq!(
            resolve_queue_mode(&cfg, &channel_cfg, &session, Channel::Whatsapp),
            QueueMode::Interrupt
        );
        // Session override beats everything.
        session.queue_mode = Some(QueueMode::Queue);
        assert_eq!(
            resolve_queue_mode(&cfg, &channel_cfg, &session, Channel::Whatsapp),
            QueueMode::Queue
        );
    }

    #[test]
    fn model_allowlist_covers_aliases_and_fallbacks() {
        let mut cfg = Config::default();
        cfg.agent.model = Some(config::ModelSpec::Full {
            primary: "claude-opus".into(),
            fallbacks: vec!["claude-sonnet".into()],
        });
        cfg.agent
            .model_aliases
            .insert("fast".into(), "claude-haiku".into());
        assert!(model_allowed(&cfg, "claude-opus"));
        assert!(model_allowed(&cfg, "claude-sonnet"));
        assert!(model_allowed(&cfg, "fast"));
        assert!(model_allowed(&cfg, "claude-haiku"));
        assert!(!model_allowed(&cfg, "gpt-17"));
    }
}
