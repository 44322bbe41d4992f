//! Gateway HTTP + WebSocket server (single port) and daemon wiring.

use crate::agent::{AgentWorker, WorkerConfig};
use crate::channels::{
    ChannelRegistry, SendOptions, TelegramChannel, WebChatChannel,
};
use crate::config::{self, Config, ConfigHandle};
use crate::cron::CronService;
use crate::envelope::Channel;
use crate::gateway::protocol::{
    event_frame, AgentParams, CronAddParams, HistoryParams, NodeInvokeParams, SendParams,
    SystemEventParams, WsRequest, WsResponse,
};
use crate::heartbeat::HeartbeatRunner;
use crate::nodes::{BridgeFrame, NodeBridge, NodeStore, OperatorPrompt, PairRequest};
use crate::outbound;
use crate::pipeline::{AgentExecutor, Pipeline, PipelineContext};
use crate::scheduler::{DeliveryRoute, PromptRequest, RunOrigin, Scheduler};
use crate::session::{self, ThinkingLevel};
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Pairing requests waiting for an operator verdict. The bridge's prompt
/// capability parks here; `nodes.approve` / `nodes.reject` resolve.
pub struct PendingPairings {
    inner: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl Default for PendingPairings {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl PendingPairings {
    pub async fn list(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    /// Resolve a pending request; returns false when none was waiting.
    pub async fn resolve(&self, node_id: &str, approve: bool) -> bool {
        match self.inner.lock().await.remove(node_id) {
            Some(tx) => tx.send(approve).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl OperatorPrompt for PendingPairings {
    async fn prompt_pairing(&self, request: &PairRequest, is_repair: bool) -> bool {
        log::info!(
            "pairing requested by {}{}",
            request.node_id,
            if is_repair { " (re-pair)" } else { "" }
        );
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .await
            .insert(request.node_id.clone(), tx);
        rx.await.unwrap_or(false)
    }
}

/// Shared state for the control plane.
#[derive(Clone)]
pub struct GatewayState {
    pub ctx: Arc<PipelineContext>,
    pub scheduler: Scheduler,
    pub node_store: Arc<NodeStore>,
    pub bridge: Option<NodeBridge>,
    pub cron: Arc<CronService>,
    pub pending: Arc<PendingPairings>,
    /// When Some, clients must authenticate with this token.
    pub required_token: Option<String>,
    pub started_at: Instant,
}

/// Run the gateway daemon; blocks until shutdown.
///
/// Non-loopback binds require a configured token, otherwise startup fails.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    let required_token = config::resolve_gateway_token(&config);
    if !config::is_loopback_bind(&bind) && required_token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.token or CLAWDIS_GATEWAY_TOKEN)",
            bind
        );
    }

    let state_dir = config::state_dir();
    tokio::fs::create_dir_all(&state_dir)
        .await
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    let (event_tx, _) = broadcast::channel::<String>(256);
    let sessions = Arc::new(session::SessionStore::load(&state_dir).await);
    let node_store = Arc::new(NodeStore::load(&state_dir).await);
    let registry = Arc::new(ChannelRegistry::new());
    let (inbound_tx, inbound_rx) = mpsc::channel(256);

    // Channels: Telegram when a token is configured, WebChat always.
    // WhatsApp/Discord attach through their transport traits when the host
    // wires an SDK in.
    if let Some(token) = config::resolve_telegram_token(&config) {
        let named: HashMap<String, String> = config
            .channels
            .telegram
            .accounts
            .iter()
            .map(|(k, v)| (k.clone(), v.bot_token.clone()))
            .collect();
        let telegram = Arc::new(TelegramChannel::new(Some(token), named));
        telegram.start_inbound(inbound_tx.clone());
        registry.register(telegram).await;
        log::info!("telegram channel registered");
    }
    registry
        .register(Arc::new(WebChatChannel::new(event_tx.clone())))
        .await;

    let worker = AgentWorker::start(WorkerConfig {
        cmd: config.agent.worker_cmd.clone(),
        thinking_cli_arg: config.agent.thinking_cli_arg,
        cancel_grace_ms: config.agent.cancel_grace_ms,
    });

    let config_handle = ConfigHandle::new(config.clone(), config_path);
    let ctx = Arc::new(PipelineContext {
        config: config_handle,
        sessions: sessions.clone(),
        registry: registry.clone(),
        worker,
        event_tx: event_tx.clone(),
    });

    let executor = Arc::new(AgentExecutor::new(ctx.clone()));
    let scheduler = Scheduler::new(executor, config.agent.max_concurrent);
    // The pipeline task owns itself; it lives as long as the inbound channel.
    Arc::new(Pipeline::new(ctx.clone(), scheduler.clone())).start(inbound_rx);

    Arc::new(HeartbeatRunner::new(ctx.clone(), scheduler.clone())).start();

    let default_session_key = format!("agent:{}:main", config.session.agent_id);
    let cron = Arc::new(CronService::load(&state_dir, scheduler.clone(), default_session_key).await);
    cron.clone().start();

    let pending = Arc::new(PendingPairings::default());
    let mut _mdns = None;
    let bridge = if config.bridge.enabled {
        let bridge = NodeBridge::new(
            node_store.clone(),
            pending.clone(),
            inbound_tx.clone(),
            event_tx.clone(),
        );
        let serve_bridge = bridge.clone();
        let bridge_bind = config.bridge.bind.clone();
        let bridge_port = config.bridge.port;
        tokio::spawn(async move {
            if let Err(e) = serve_bridge.serve(&bridge_bind, bridge_port).await {
                log::error!("node bridge exited: {}", e);
            }
        });
        match crate::nodes::advertise_bridge(bridge_port) {
            Ok(daemon) => _mdns = Some(daemon),
            Err(e) => log::warn!("mDNS advertisement failed: {}", e),
        }
        Some(bridge)
    } else {
        None
    };

    let state = GatewayState {
        ctx,
        scheduler,
        node_store,
        bridge,
        cron,
        pending,
        required_token,
        started_at: Instant::now(),
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(event_tx))
    .await
    .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM; broadcasts a shutdown event first.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
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
    log::info!("shutdown signal received");
    let _ = event_tx.send(event_frame("shutdown", json!({})));
}

/// GET / returns health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(health_payload(&state).await)
}

async fn health_payload(state: &GatewayState) -> serde_json::Value {
    let mut providers = serde_json::Map::new();
    for channel in state.ctx.registry.channels().await {
        if let Some(handle) = state.ctx.registry.get(channel).await {
            providers.insert(
                channel.as_str().to_string(),
                json!({
                    "linked": handle.is_linked(),
                    "lastLinkedAt": handle.last_linked_at_ms(),
                }),
            );
        }
    }
    json!({ "ok": true, "providers": providers })
}

/// GET /ws upgrades to the control-plane WebSocket.
async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, peer: SocketAddr) {
    let mut event_rx = state.ctx.event_tx.subscribe();
    // Loopback peers pass without a token when none is required; otherwise
    // the first frame must be `hello { token }`.
    let mut authed = state.required_token.is_none() && peer.ip().is_loopback();

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Ok(line) => {
                        let is_shutdown = line.contains("\"event\":\"shutdown\"");
                        if socket.send(Message::Text(line)).await.is_err() {
                            break;
                        }
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let req: WsRequest = match serde_json::from_str(&text) {
                    Ok(r) => r,
                    Err(_) => {
                        let res = WsResponse::err("", "INVALID_REQUEST", "malformed frame");
                        let _ = socket.send(Message::Text(res.to_line())).await;
                        continue;
                    }
                };

                if req.method == "hello" {
                    let provided = req.params.get("token").and_then(|v| v.as_str()).unwrap_or("");
                    let ok = match &state.required_token {
                        Some(required) => provided.trim() == required,
                        None => peer.ip().is_loopback(),
                    };
                    let res = if ok {
                        authed = true;
                        WsResponse::ok(&req.id, json!({ "ok": true }))
                    } else {
                        WsResponse::err(&req.id, "UNAUTHORIZED", "bad token")
                    };
                    let _ = socket.send(Message::Text(res.to_line())).await;
                    continue;
                }

                if !authed && req.method != "health" {
                    let res = WsResponse::err(&req.id, "UNAUTHORIZED", "authenticate first");
                    let _ = socket.send(Message::Text(res.to_line())).await;
                    continue;
                }

                let res = dispatch(&state, req).await;
                if socket.send(Message::Text(res.to_line())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn dispatch(state: &GatewayState, req: WsRequest) -> WsResponse {
    match req.method.as_str() {
        "health" => WsResponse::ok(&req.id, health_payload(state).await),

        "status" => {
            let cfg = state.ctx.config.get().await;
            let heartbeats: serde_json::Map<String, serde_json::Value> = cfg
                .heartbeat
                .iter()
                .filter_map(|(k, v)| v.every.clone().map(|e| (k.clone(), json!(e))))
                .collect();
            WsResponse::ok(
                &req.id,
                json!({
                    "sessions": state.ctx.sessions.count().await,
                    "runsInFlight": state.scheduler.in_flight(),
                    "heartbeats": heartbeats,
                    "uptimeSecs": state.started_at.elapsed().as_secs(),
                }),
            )
        }

        "send" => {
            let params: SendParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            let channel = match params.channel.as_deref() {
                Some(c) => match Channel::parse(c) {
                    Some(c) => c,
                    None => {
                        return WsResponse::err(&req.id, "INVALID_REQUEST", "unknown channel")
                    }
                },
                None => Channel::Whatsapp,
            };
            let Some(handle) = state.ctx.registry.get(channel).await else {
                return WsResponse::err(&req.id, "UNAVAILABLE", "channel not running");
            };
            let opts = SendOptions {
                account_id: params.account_id.clone(),
            };
            let cleaned = outbound::strip_think_segments(&params.message);
            for chunk in outbound::chunk_text(&cleaned, outbound::DEFAULT_MAX_CHUNK_CHARS) {
                if let Err(e) = handle.send_message(&params.to, &chunk, &opts).await {
                    return WsResponse::err(&req.id, "UNAVAILABLE", e);
                }
            }
            let route = DeliveryRoute {
                channel,
                to: params.to.clone(),
                account_id: params.account_id.clone(),
            };
            for media in &params.media {
                if let Err(e) =
                    crate::pipeline::deliver_media(&state.ctx, &route, media, None).await
                {
                    return WsResponse::err(&req.id, "UNAVAILABLE", e);
                }
            }
            WsResponse::ok(
                &req.id,
                json!({ "messageId": format!("out-{}", uuid::Uuid::new_v4()) }),
            )
        }

        "agent" | "chat.send" => {
            let params: AgentParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            let cfg = state.ctx.config.get().await;
            let session_key = params
                .session_key
                .clone()
                .unwrap_or_else(|| format!("agent:{}:main", cfg.session.agent_id));
            let route = match (params.channel.as_deref(), params.to.as_deref()) {
                (Some(c), Some(to)) => Channel::parse(c).map(|channel| DeliveryRoute {
                    channel,
                    to: to.to_string(),
                    account_id: None,
                }),
                _ => None,
            };
            let thinking = match params.thinking.as_deref() {
                Some(level) => match ThinkingLevel::parse(level) {
                    Some(l) => Some(l),
                    None => {
                        return WsResponse::err(&req.id, "INVALID_REQUEST", "unknown thinking level")
                    }
                },
                None => None,
            };
            let mut request = PromptRequest::user(&session_key, &params.message);
            request.origin = RunOrigin::Control;
            request.deliver = params.deliver.unwrap_or(route.is_some());
            request.route = route;
            request.thinking = thinking;
            let run_id = state.scheduler.submit(request).await;
            WsResponse::ok(&req.id, json!({ "runId": run_id }))
        }

        "chat.history" => {
            let params: HistoryParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            match state.ctx.sessions.read_transcript(&params.session_key).await {
                Ok(messages) => WsResponse::ok(
                    &req.id,
                    json!({ "messages": messages }),
                ),
                Err(e) => WsResponse::err(&req.id, "FATAL", e.to_string()),
            }
        }

        "config.get" => {
            let cfg = state.ctx.config.get().await;
            match serde_json::to_value(&cfg) {
                Ok(v) => WsResponse::ok(&req.id, json!({ "config": v })),
                Err(e) => WsResponse::err(&req.id, "FATAL", e.to_string()),
            }
        }

        "config.set" => {
            let Some(raw) = req.params.get("config") else {
                return WsResponse::err(&req.id, "INVALID_REQUEST", "missing config");
            };
            let cfg: Config = match serde_json::from_value(raw.clone()) {
                Ok(c) => c,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            match state.ctx.config.set(cfg).await {
                Ok(()) => WsResponse::ok(&req.id, json!({ "ok": true })),
                Err(e) => WsResponse::err(&req.id, "FATAL", e.to_string()),
            }
        }

        "nodes.list" => {
            let nodes = state.node_store.list().await;
            let connected = match &state.bridge {
                Some(b) => b.connected().await,
                None => Vec::new(),
            };
            WsResponse::ok(&req.id, json!({ "nodes": nodes, "connected": connected }))
        }

        "nodes.pending" => {
            WsResponse::ok(&req.id, json!({ "pending": state.pending.list().await }))
        }

        "nodes.approve" | "nodes.reject" => {
            let node_id = req
                .params
                .get("nodeId")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if node_id.is_empty() {
                return WsResponse::err(&req.id, "INVALID_REQUEST", "missing nodeId");
            }
            let approve = req.method == "nodes.approve";
            let found = state.pending.resolve(node_id, approve).await;
            if found {
                WsResponse::ok(&req.id, json!({ "ok": true }))
            } else {
                WsResponse::err(&req.id, "INVALID_REQUEST", "no pending pairing")
            }
        }

        "nodes.invoke" => {
            let params: NodeInvokeParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            let Some(bridge) = &state.bridge else {
                return WsResponse::err(&req.id, "UNAVAILABLE", "bridge disabled");
            };
            match bridge
                .invoke(&params.node_id, &params.command, params.params_json, None)
                .await
            {
                Ok(BridgeFrame::InvokeResult {
                    ok,
                    result_json,
                    error,
                    ..
                }) => WsResponse::ok(
                    &req.id,
                    json!({ "ok": ok, "resultJson": result_json, "error": error }),
                ),
                Ok(_) => WsResponse::err(&req.id, "FATAL", "unexpected bridge frame"),
                Err(e) => WsResponse::err(&req.id, e.code(), e.user_summary()),
            }
        }

        "cron.list" => WsResponse::ok(&req.id, json!({ "jobs": state.cron.list().await })),

        "cron.add" => {
            let params: CronAddParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            match state
                .cron
                .add(params.schedule, params.message, params.session_key)
                .await
            {
                Ok(job) => WsResponse::ok(&req.id, json!({ "job": job })),
                Err(e) => WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            }
        }

        "cron.remove" => {
            let id = req.params.get("id").and_then(|v| v.as_str()).unwrap_or("");
            match state.cron.remove(id).await {
                Ok(true) => WsResponse::ok(&req.id, json!({ "ok": true })),
                Ok(false) => WsResponse::err(&req.id, "INVALID_REQUEST", "unknown job"),
                Err(e) => WsResponse::err(&req.id, "FATAL", e.to_string()),
            }
        }

        "cron.runNow" => {
            let id = req.params.get("id").and_then(|v| v.as_str()).unwrap_or("");
            match state.cron.run_now(id).await {
                Ok(()) => WsResponse::ok(&req.id, json!({ "ok": true })),
                Err(e) => WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            }
        }

        "system-event" => {
            let params: SystemEventParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, "INVALID_REQUEST", e.to_string()),
            };
            log::info!(
                "system-event [{}] {}",
                params.mode.as_deref().unwrap_or("info"),
                params.text
            );
            let _ = state.ctx.event_tx.send(event_frame(
                "log",
                json!({
                    "level": params.mode.unwrap_or_else(|| "info".into()),
                    "msg": params.text,
                    "meta": { "instanceId": params.instance_id, "tags": params.tags },
                }),
            ));
            WsResponse::ok(&req.id, json!({ "ok": true }))
        }

        "models.list" => {
            let cfg = state.ctx.config.get().await;
            let selection = config::resolve_model(&cfg);
            WsResponse::ok(
                &req.id,
                json!({
                    "primary": selection.primary,
                    "fallbacks": selection.fallbacks,
                    "aliases": cfg.agent.model_aliases,
                }),
            )
        }

        other => WsResponse::err(
            &req.id,
            "UNKNOWN_METHOD",
            format!("unknown method: {}", other),
        ),
    }
}
