//! Configuration types and loading.
//!
//! Config is merged from defaults, the JSON file (`~/.clawdis/config.json`),
//! environment variables, and runtime overrides applied through `config.set`.
//! Consumers hold a [`ConfigHandle`] and see a typed snapshot; a watch channel
//! notifies long-lived tasks when the config changes.

use crate::envelope::Channel;
use crate::session::{Activation, QueueMode, ThinkingLevel};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// Heartbeat settings per channel name ("whatsapp", "telegram", ...).
    #[serde(default)]
    pub heartbeat: HashMap<String, HeartbeatConfig>,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub admin: AdminConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Control-plane WebSocket port (default 18789).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1"). Non-loopback binds require a token.
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Shared secret for WS clients. Overridden by CLAWDIS_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            token: None,
        }
    }
}

/// Per-channel settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: ChannelConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: ChannelConfig,
    #[serde(default)]
    pub webchat: ChannelConfig,
}

/// Settings common to every transport: allowlist, queue override, groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Sender identifiers allowed to talk to the agent; `*` matches any.
    #[serde(default)]
    pub allow_from: Vec<String>,

    /// Identifiers this bot answers to in @-mentions (username, phone, id).
    #[serde(default)]
    pub bot_ids: Vec<String>,

    /// Queue-vs-interrupt override for this channel. None means the built-in
    /// channel default (WhatsApp/Telegram interrupt, Discord/WebChat queue).
    #[serde(default)]
    pub queue_mode: Option<QueueMode>,

    /// Per-group activation settings, keyed by group chat key.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,

    /// Max outbound chunk size in characters (default 4000).
    #[serde(default)]
    pub max_chunk_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    /// Whether the bot must be @-mentioned in this group. Unset defaults to true.
    #[serde(default)]
    pub require_mention: Option<bool>,
    #[serde(default)]
    pub activation: Option<Activation>,
}

/// Telegram channel config: the common fields plus bot token(s).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(flatten)]
    pub common: ChannelConfig,

    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,

    /// Additional named accounts ({ name: { botToken } }) for multi-account use.
    #[serde(default)]
    pub accounts: HashMap<String, TelegramAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramAccount {
    pub bot_token: String,
}

/// Agent worker and run policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Command line used to spawn the agent worker (argv; no shell).
    #[serde(default)]
    pub worker_cmd: Vec<String>,

    /// Cross-session cap on parallel runs.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Primary model and fallbacks; accepts a bare string or
    /// `{ "primary": ..., "fallbacks": [...] }` and is normalized at load.
    #[serde(default)]
    pub model: Option<ModelSpec>,

    /// Aliases the operator may select via `/model`; also the fallback allowlist.
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,

    /// Whether the worker accepts `--thinking <level>`. When false, cue tokens
    /// are appended to the prompt instead.
    #[serde(default)]
    pub thinking_cli_arg: bool,

    /// Default per-run timeout (chat.send), ms.
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,

    /// Hard cap on any run, ms.
    #[serde(default = "default_hard_timeout_ms")]
    pub hard_timeout_ms: u64,

    /// Grace between soft cancel and SIGTERM, and between SIGTERM and SIGKILL, ms.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Debounce window for non-chat scheduled operations, ms.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Default queue-vs-interrupt mode when neither session nor channel overrides.
    #[serde(default)]
    pub queue_mode: Option<QueueMode>,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_run_timeout_ms() -> u64 {
    120_000
}

fn default_hard_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_debounce_ms() -> u64 {
    1_000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            worker_cmd: Vec::new(),
            max_concurrent: default_max_concurrent(),
            model: None,
            model_aliases: HashMap::new(),
            thinking_cli_arg: false,
            run_timeout_ms: default_run_timeout_ms(),
            hard_timeout_ms: default_hard_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            debounce_ms: default_debounce_ms(),
            queue_mode: None,
        }
    }
}

/// Model reference as written in config: either a bare ref string or an object
/// with explicit fallbacks. Consumers only see the normalized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSpec {
    Ref(String),
    Full {
        primary: String,
        #[serde(default)]
        fallbacks: Vec<String>,
    },
}

/// Normalized model selection: primary plus ordered fallbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl ModelSpec {
    pub fn normalize(&self) -> ModelSelection {
        match self {
            ModelSpec::Ref(s) => ModelSelection {
                primary: s.trim().to_string(),
                fallbacks: Vec::new(),
            },
            ModelSpec::Full { primary, fallbacks } => ModelSelection {
                primary: primary.trim().to_string(),
                fallbacks: fallbacks.iter().map(|s| s.trim().to_string()).collect(),
            },
        }
    }
}

/// Session keying policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Agent identifier used in session keys.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// When true, direct chats collapse into the session key `main`.
    #[serde(default)]
    pub collapse_direct_to_main: bool,
}

fn default_agent_id() -> String {
    "default".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            collapse_direct_to_main: false,
        }
    }
}

/// Heartbeat policy for one channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfig {
    /// Interval like "5m", "300s", "1h". Absent disables the heartbeat.
    #[serde(default)]
    pub every: Option<String>,

    /// Override delivery channel (default: session lastChannel).
    #[serde(default)]
    pub target: Option<String>,

    /// Override delivery recipient (default: session lastTo).
    #[serde(default)]
    pub to: Option<String>,

    /// Subaccount for multi-account providers.
    #[serde(default)]
    pub account_id: Option<String>,

    /// Thinking level injected as an inline directive on the probe prompt.
    #[serde(default)]
    pub think: Option<ThinkingLevel>,

    /// Max chars of an acknowledgement reply to deliver; 0 disables the cap.
    #[serde(default)]
    pub ack_max_chars: usize,

    #[serde(default)]
    pub visibility: HeartbeatVisibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatVisibility {
    #[serde(default)]
    pub show_ok: bool,
    #[serde(default = "default_true")]
    pub show_alerts: bool,
    #[serde(default)]
    pub use_indicator: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HeartbeatVisibility {
    fn default() -> Self {
        Self {
            show_ok: false,
            show_alerts: true,
            use_indicator: false,
        }
    }
}

/// Paired-node bridge listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default = "default_bridge_port")]
    pub port: u16,
}

fn default_bridge_port() -> u16 {
    18790
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_gateway_bind(),
            port: default_bridge_port(),
        }
    }
}

/// Privileged-operation policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    /// Senders allowed to issue privileged directives such as /restart.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

/// Resolve the state root: OPENCLAW_STATE_DIR env, else ~/.clawdis.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("OPENCLAW_STATE_DIR") {
        let t = dir.trim();
        if !t.is_empty() {
            return PathBuf::from(t);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".clawdis"))
        .unwrap_or_else(|| PathBuf::from(".clawdis"))
}

/// Default config file path under the state root.
pub fn default_config_path() -> PathBuf {
    state_dir().join("config.json")
}

/// Resolve the gateway token: env CLAWDIS_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty_env("CLAWDIS_GATEWAY_TOKEN").or_else(|| {
        config
            .gateway
            .token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_BOT_TOKEN").or_else(|| {
        config
            .channels
            .telegram
            .bot_token
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, localhost).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Built-in queue-mode default per channel: WhatsApp and Telegram interrupt,
/// Discord and WebChat (and node) queue.
pub fn channel_default_queue_mode(channel: Channel) -> QueueMode {
    match channel {
        Channel::Whatsapp | Channel::Telegram => QueueMode::Interrupt,
        Channel::Discord | Channel::Webchat | Channel::Node => QueueMode::Queue,
    }
}

/// Common channel config lookup by channel.
pub fn channel_config(config: &Config, channel: Channel) -> &ChannelConfig {
    match channel {
        Channel::Whatsapp => &config.channels.whatsapp,
        Channel::Telegram => &config.channels.telegram.common,
        Channel::Discord => &config.channels.discord,
        // Node ingress reuses the webchat policy (both are operator-local).
        Channel::Webchat | Channel::Node => &config.channels.webchat,
    }
}

/// Normalized model selection for the agent, defaulting when unset.
pub fn resolve_model(config: &Config) -> ModelSelection {
    config
        .agent
        .model
        .as_ref()
        .map(|m| m.normalize())
        .unwrap_or_else(|| ModelSelection {
            primary: "claude-sonnet".to_string(),
            fallbacks: Vec::new(),
        })
}

/// Parse an interval like "300s", "5m", "1h" into a duration.
pub fn parse_interval(s: &str) -> Option<std::time::Duration> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    let (num, unit) = t.split_at(t.len() - 1);
    let (value, mult) = match unit {
        "s" => (num, 1u64),
        "m" => (num, 60),
        "h" => (num, 3_600),
        _ => (t, 1),
    };
    value
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0)
        .map(|v| std::time::Duration::from_secs(v * mult))
}

/// Load config from the given path (or the default); missing file yields defaults.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = match std::fs::read_to_string(&path) {
        Ok(s) => serde_json::from_str(&s)
            .with_context(|| format!("parsing config {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
    };
    Ok((config, path))
}

/// Shared, mutable view of the config with change notifications. Runtime
/// overrides via `config.set` replace the snapshot, persist it, and wake
/// watchers.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Config>>,
    path: Arc<PathBuf>,
    changed_tx: Arc<watch::Sender<u64>>,
}

impl ConfigHandle {
    pub fn new(config: Config, path: PathBuf) -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(config)),
            path: Arc::new(path),
            changed_tx: Arc::new(changed_tx),
        }
    }

    /// Current snapshot (cheap clone; config is small).
    pub async fn get(&self) -> Config {
        self.inner.read().await.clone()
    }

    /// Replace the config, persist it, and notify watchers.
    pub async fn set(&self, config: Config) -> Result<()> {
        let json = serde_json::to_string_pretty(&config).context("serializing config")?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        tokio::fs::write(self.path.as_ref(), json)
            .await
            .with_context(|| format!("writing config {}", self.path.display()))?;
        *self.inner.write().await = config;
        self.changed_tx.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Subscribe to change notifications.
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
