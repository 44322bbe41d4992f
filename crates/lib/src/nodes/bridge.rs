//! Paired-node bridge: a TCP listener speaking line-delimited JSON frames,
//! advertised over mDNS. Handles pairing approval, token auth, the
//! invoke/result correlation map, ping/pong liveness, and node-pushed events
//! that become synthetic envelopes for the scheduler.

use crate::envelope::{Channel, ChatType, Envelope};
use crate::nodes::store::{generate_token, NodeStore, PairedNode};
use crate::store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};

pub const PAIRING_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);
const INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const PING_EVERY: Duration = Duration::from_secs(20);
const IDLE_DISCONNECT: Duration = Duration::from_secs(60);

/// Bridge wire frames, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BridgeFrame {
    Hello {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_family: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_identifier: Option<String>,
        #[serde(default)]
        caps: Vec<String>,
        #[serde(default)]
        commands: Vec<String>,
    },
    Pair {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    AuthOk {
        /// Present when a pairing just issued a fresh token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    AuthError {
        code: String,
        message: String,
    },
    NotPaired {},
    Invoke {
        id: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params_json: Option<String>,
    },
    InvokeResult {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_json: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_json: Option<String>,
    },
    Ping {},
    Pong {},
}

/// Pairing request surfaced to the host operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequest {
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Host capability that asks the operator to approve or reject a pairing.
/// `is_repair` marks an existing nodeId pairing again.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn prompt_pairing(&self, request: &PairRequest, is_repair: bool) -> bool;
}

struct Connection {
    writer_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<BridgeFrame>>>>,
}

struct BridgeInner {
    store: Arc<NodeStore>,
    prompt: Arc<dyn OperatorPrompt>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    /// Synthetic envelopes (voice transcripts etc.) headed for the pipeline.
    inbound_tx: mpsc::Sender<Envelope>,
    /// Serialized control-plane event frames (presence, pairing.pending).
    event_tx: broadcast::Sender<String>,
}

/// The bridge; cheap to clone.
#[derive(Clone)]
pub struct NodeBridge {
    inner: Arc<BridgeInner>,
}

impl NodeBridge {
    pub fn new(
        store: Arc<NodeStore>,
        prompt: Arc<dyn OperatorPrompt>,
        inbound_tx: mpsc::Sender<Envelope>,
        event_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                store,
                prompt,
                connections: RwLock::new(HashMap::new()),
                inbound_tx,
                event_tx,
            }),
        }
    }

    /// Bind and serve the bridge listener until the task is dropped.
    pub async fn serve(&self, bind: &str, port: u16) -> Result<()> {
        let addr = format!("{}:{}", bind, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding bridge to {}", addr))?;
        log::info!("node bridge listening on {}", addr);
        loop {
            let (stream, peer) = listener.accept().await.context("bridge accept")?;
            log::debug!("bridge connection from {}", peer);
            let bridge = self.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge.handle_connection(stream).await {
                    log::debug!("bridge connection ended: {}", e);
                }
            });
        }
    }

    /// Node ids currently connected.
    pub async fn connected(&self) -> Vec<String> {
        self.inner.connections.read().await.keys().cloned().collect()
    }

    /// Invoke a command on a connected node. Times out after `timeout`
    /// (default 30 s); disconnected nodes fail with UNAVAILABLE.
    pub async fn invoke(
        &self,
        node_id: &str,
        command: &str,
        params_json: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<BridgeFrame, crate::error::GatewayError> {
        use crate::error::GatewayError;
        let conn = {
            let g = self.inner.connections.read().await;
            g.get(node_id).cloned()
        };
        let Some(conn) = conn else {
            return Err(GatewayError::Transport(format!(
                "node not connected: {}",
                node_id
            )));
        };
        let id = format!("inv-{}", uuid::Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        conn.pending.lock().await.insert(id.clone(), tx);
        let frame = BridgeFrame::Invoke {
            id: id.clone(),
            command: command.to_string(),
            params_json,
        };
        if send_frame(&conn.writer_tx, &frame).await.is_err() {
            conn.pending.lock().await.remove(&id);
            return Err(GatewayError::Transport("node connection lost".to_string()));
        }
        match tokio::time::timeout(timeout.unwrap_or(INVOKE_TIMEOUT), rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(GatewayError::Transport("node disconnected".to_string())),
            Err(_) => {
                conn.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(format!(
                    "invoke {} timed out",
                    command
                )))
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // Writer task: everything outbound funnels through one channel.
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(64);
        let writer = tokio::spawn(async move {
            while let Some(line) = writer_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        let mut authed: Option<String> = None;
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<BridgeFrame>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut ping = tokio::time::interval(PING_EVERY);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                line = tokio::time::timeout(IDLE_DISCONNECT, lines.next_line()) => {
                    let line = match line {
                        Err(_) => break Ok(()), // idle > 60 s
                        Ok(Ok(Some(line))) => line,
                        Ok(Ok(None)) => break Ok(()),
                        Ok(Err(e)) => break Err(anyhow::Error::from(e)),
                    };
                    let frame: BridgeFrame = match serde_json::from_str(line.trim()) {
                        Ok(f) => f,
                        Err(_) => {
                            send_frame(&writer_tx, &BridgeFrame::AuthError {
                                code: "INVALID_REQUEST".into(),
                                message: "malformed frame".into(),
                            })
                            .await?;
                            continue;
                        }
                    };
                    if self
                        .handle_frame(frame, &writer_tx, &mut authed, &pending)
                        .await?
                    {
                        break Ok(());
                    }
                }
                _ = ping.tick() => {
                    if send_frame(&writer_tx, &BridgeFrame::Ping {}).await.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        if let Some(node_id) = authed {
            self.inner.connections.write().await.remove(&node_id);
            self.emit_presence(&node_id, false);
            log::info!("node disconnected: {}", node_id);
        }
        writer.abort();
        result
    }

    /// Returns true when the connection should close.
    async fn handle_frame(
        &self,
        frame: BridgeFrame,
        writer_tx: &mpsc::Sender<String>,
        authed: &mut Option<String>,
        pending: &Arc<Mutex<HashMap<String, oneshot::Sender<BridgeFrame>>>>,
    ) -> Result<bool> {
        // Invoke results resolve their pending waiter with the whole frame.
        let invoke_id = match &frame {
            BridgeFrame::InvokeResult { id, .. } => Some(id.clone()),
            _ => None,
        };
        if let Some(id) = invoke_id {
            match pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => log::debug!("invoke_result for unknown id {}", id),
            }
            return Ok(false);
        }

        match frame {
            BridgeFrame::Hello {
                node_id,
                display_name,
                token,
                platform,
                version,
                device_family,
                model_identifier,
                caps,
                commands,
            } => {
                let node_id = node_id.trim().to_string();
                if node_id.is_empty() {
                    send_frame(
                        writer_tx,
                        &BridgeFrame::AuthError {
                            code: "INVALID_REQUEST".into(),
                            message: "nodeId must not be empty".into(),
                        },
                    )
                    .await?;
                    return Ok(true);
                }
                let known = self.inner.store.get(&node_id).await;
                match (known, token) {
                    (Some(node), Some(token)) if node.token == token => {
                        // Refresh mutable metadata on every hello.
                        let mut updated = node;
                        updated.display_name = display_name.or(updated.display_name);
                        updated.platform = platform.or(updated.platform);
                        updated.version = version.or(updated.version);
                        updated.device_family = device_family.or(updated.device_family);
                        updated.model_identifier =
                            model_identifier.or(updated.model_identifier);
                        if !caps.is_empty() {
                            updated.caps = caps;
                        }
                        if !commands.is_empty() {
                            updated.commands = commands;
                        }
                        self.inner.store.upsert(updated).await?;
                        self.inner.store.touch_last_seen(&node_id).await?;
                        self.register_connection(&node_id, writer_tx, pending).await;
                        *authed = Some(node_id.clone());
                        send_frame(writer_tx, &BridgeFrame::AuthOk { token: None }).await?;
                        log::info!("node connected: {}", node_id);
                    }
                    (Some(_), Some(_)) => {
                        send_frame(
                            writer_tx,
                            &BridgeFrame::AuthError {
                                code: "UNAUTHORIZED".into(),
                                message: "token mismatch".into(),
                            },
                        )
                        .await?;
                        return Ok(true);
                    }
                    _ => {
                        send_frame(writer_tx, &BridgeFrame::NotPaired {}).await?;
                    }
                }
            }
            BridgeFrame::Pair {
                node_id,
                display_name,
                platform,
                version,
            } => {
                let node_id = node_id.trim().to_string();
                if node_id.is_empty() {
                    send_frame(
                        writer_tx,
                        &BridgeFrame::AuthError {
                            code: "INVALID_REQUEST".into(),
                            message: "nodeId must not be empty".into(),
                        },
                    )
                    .await?;
                    return Ok(true);
                }
                let request = PairRequest {
                    node_id: node_id.clone(),
                    display_name: display_name.clone(),
                    platform: platform.clone(),
                    version: version.clone(),
                };
                let is_repair = self.inner.store.get(&node_id).await.is_some();
                self.emit_pairing_pending(&request);
                let approved = tokio::time::timeout(
                    PAIRING_PROMPT_TIMEOUT,
                    self.inner.prompt.prompt_pairing(&request, is_repair),
                )
                .await
                .unwrap_or(false);
                if !approved {
                    send_frame(
                        writer_tx,
                        &BridgeFrame::AuthError {
                            code: "PAIR_REJECTED".into(),
                            message: "operator rejected pairing".into(),
                        },
                    )
                    .await?;
                    return Ok(true);
                }
                let token = generate_token()?;
                let now = store::now_ms();
                self.inner
                    .store
                    .upsert(PairedNode {
                        node_id: node_id.clone(),
                        display_name,
                        platform,
                        version,
                        device_family: None,
                        model_identifier: None,
                        token: token.clone(),
                        caps: Vec::new(),
                        commands: Vec::new(),
                        created_at_ms: now,
                        last_seen_at_ms: now,
                    })
                    .await?;
                self.register_connection(&node_id, writer_tx, pending).await;
                *authed = Some(node_id.clone());
                send_frame(writer_tx, &BridgeFrame::AuthOk { token: Some(token) }).await?;
                log::info!("node paired: {}", node_id);
            }
            BridgeFrame::Event {
                event,
                payload_json,
            } => {
                if authed.is_none() {
                    return Ok(false);
                }
                self.handle_node_event(authed.as_deref().unwrap(), &event, payload_json)
                    .await;
            }
            BridgeFrame::Ping {} => {
                send_frame(writer_tx, &BridgeFrame::Pong {}).await?;
            }
            BridgeFrame::Pong {} => {}
            // Server-to-node frames arriving inbound are protocol errors.
            _ => {
                send_frame(
                    writer_tx,
                    &BridgeFrame::AuthError {
                        code: "INVALID_REQUEST".into(),
                        message: "unexpected frame".into(),
                    },
                )
                .await?;
            }
        }
        Ok(false)
    }

    async fn register_connection(
        &self,
        node_id: &str,
        writer_tx: &mpsc::Sender<String>,
        pending: &Arc<Mutex<HashMap<String, oneshot::Sender<BridgeFrame>>>>,
    ) {
        let conn = Arc::new(Connection {
            writer_tx: writer_tx.clone(),
            pending: pending.clone(),
        });
        self.inner
            .connections
            .write()
            .await
            .insert(node_id.to_string(), conn);
        self.emit_presence(node_id, true);
    }

    /// Route a node-pushed event. `voice.transcript` becomes a synthetic
    /// envelope for the scheduler; everything else is forwarded to
    /// control-plane subscribers.
    async fn handle_node_event(&self, node_id: &str, event: &str, payload_json: Option<String>) {
        if event == "voice.transcript" {
            #[derive(Deserialize)]
            #[serde(rename_all = "camelCase")]
            struct Transcript {
                text: String,
                #[serde(default)]
                session_key: Option<String>,
                #[serde(default)]
                deliver: Option<bool>,
            }
            let Some(payload) = payload_json else { return };
            let t: Transcript = match serde_json::from_str(&payload) {
                Ok(t) => t,
                Err(e) => {
                    log::debug!("bad voice.transcript payload: {}", e);
                    return;
                }
            };
            let from = format!("node-{}", node_id);
            let chat_key = t.session_key.unwrap_or_else(|| from.clone());
            let mut envelope = Envelope::text(
                Channel::Node,
                "node-bridge",
                from,
                ChatType::Direct,
                chat_key,
                t.text,
            );
            if t.deliver == Some(false) {
                envelope.deliver = false;
            }
            if self.inner.inbound_tx.send(envelope).await.is_err() {
                log::warn!("inbound pipeline closed; dropping node transcript");
            }
            return;
        }
        let frame = serde_json::json!({
            "event": "node.event",
            "payload": { "nodeId": node_id, "event": event, "payloadJson": payload_json }
        });
        if let Ok(line) = serde_json::to_string(&frame) {
            let _ = self.inner.event_tx.send(line);
        }
    }

    fn emit_presence(&self, node_id: &str, connected: bool) {
        let frame = serde_json::json!({
            "event": "presence",
            "payload": { "nodeId": node_id, "state": if connected { "connected" } else { "disconnected" } }
        });
        if let Ok(line) = serde_json::to_string(&frame) {
            let _ = self.inner.event_tx.send(line);
        }
    }

    fn emit_pairing_pending(&self, request: &PairRequest) {
        let frame = serde_json::json!({
            "event": "pairing.pending",
            "payload": { "request": request }
        });
        if let Ok(line) = serde_json::to_string(&frame) {
            let _ = self.inner.event_tx.send(line);
        }
    }
}

async fn send_frame(writer_tx: &mpsc::Sender<String>, frame: &BridgeFrame) -> Result<()> {
    let line = serde_json::to_string(frame).context("serializing bridge frame")?;
    writer_tx
        .send(line)
        .await
        .map_err(|_| anyhow::anyhow!("bridge writer closed"))
}

/// Advertise the bridge over mDNS as `_clawdis-bridge._tcp.local.`.
pub fn advertise_bridge(port: u16) -> Result<mdns_sd::ServiceDaemon> {
    let daemon = mdns_sd::ServiceDaemon::new().context("starting mDNS daemon")?;
    let host = hostname();
    let properties = [("role", "gateway")];
    let service = mdns_sd::ServiceInfo::new(
        "_clawdis-bridge._tcp.local.",
        &host,
        &format!("{}.local.", host),
        (),
        port,
        &properties[..],
    )
    .context("building mDNS service info")?
    .enable_addr_auto();
    daemon
        .register(service)
        .context("registering mDNS service")?;
    log::info!("bridge advertised via mDNS as {}", host);
    Ok(daemon)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "clawdis".to_string())
}
