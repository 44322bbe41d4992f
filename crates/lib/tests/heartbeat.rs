//! Heartbeat delivery rules, driven through the real scheduler with a
//! scripted run executor and recording channels.

use async_trait::async_trait;
use lib::agent::{AgentWorker, WorkerConfig};
use lib::channels::{ChannelHandle, ChannelRegistry, SendOptions};
use lib::config::{Config, ConfigHandle, HeartbeatConfig, HeartbeatVisibility};
use lib::envelope::Channel;
use lib::heartbeat::HeartbeatRunner;
use lib::pipeline::PipelineContext;
use lib::scheduler::{RunContext, RunExecutor, RunOutcome, Scheduler};
use lib::session::SessionStore;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

struct RecordingChannel {
    channel: Channel,
    sends: Mutex<Vec<(String, String, Option<String>)>>,
}

impl RecordingChannel {
    fn new(channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            sends: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ChannelHandle for RecordingChannel {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn stop(&self) {}

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), String> {
        self.sends
            .lock()
            .await
            .push((to.to_string(), text.to_string(), opts.account_id.clone()));
        Ok(())
    }
}

/// Returns a fixed final text and honors the result channel contract.
struct ScriptedExecutor {
    text: String,
}

#[async_trait]
impl RunExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: RunContext) -> RunOutcome {
        let outcome = RunOutcome::Final {
            text: self.text.clone(),
        };
        if let Some(tx) = &ctx.request.result_tx {
            let _ = tx.send(outcome.clone()).await;
        }
        outcome
    }
}

async fn heartbeat_harness(
    agent_text: &str,
    channel: Channel,
) -> (
    HeartbeatRunner,
    Arc<SessionStore>,
    Arc<RecordingChannel>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::load(dir.path()).await);
    let registry = Arc::new(ChannelRegistry::new());
    let recording = RecordingChannel::new(channel);
    registry.register(recording.clone()).await;

    let (event_tx, _) = broadcast::channel(16);
    let ctx = Arc::new(PipelineContext {
        config: ConfigHandle::new(Config::default(), dir.path().join("config.json")),
        sessions: sessions.clone(),
        registry,
        worker: AgentWorker::start(WorkerConfig {
            cmd: Vec::new(),
            thinking_cli_arg: true,
            cancel_grace_ms: 100,
        }),
        event_tx,
    });
    let scheduler = Scheduler::new(
        Arc::new(ScriptedExecutor {
            text: agent_text.to_string(),
        }),
        2,
    );
    (
        HeartbeatRunner::new(ctx, scheduler),
        sessions,
        recording,
        dir,
    )
}

fn visibility(show_ok: bool) -> HeartbeatConfig {
    HeartbeatConfig {
        every: Some("5m".into()),
        target: None,
        to: None,
        account_id: None,
        think: None,
        ack_max_chars: 0,
        visibility: HeartbeatVisibility {
            show_ok,
            show_alerts: true,
            use_indicator: false,
        },
    }
}

#[tokio::test]
async fn heartbeat_ok_suppressed_and_updated_at_stable() {
    let (runner, sessions, channel, _dir) =
        heartbeat_harness("<b>HEARTBEAT_OK</b>", Channel::Whatsapp).await;

    sessions
        .update("agent:default:main", |s| {
            s.last_channel = Some(Channel::Whatsapp);
            s.last_provider = Some("whatsapp-web".into());
            s.last_to = Some("+491701".into());
        })
        .await
        .unwrap();
    let before = sessions.get("agent:default:main").await;

    runner.run_once("whatsapp", &visibility(false)).await.unwrap();

    assert!(
        channel.sends.lock().await.is_empty(),
        "HEARTBEAT_OK must not be delivered with showOk=false"
    );
    let after = sessions.get("agent:default:main").await;
    assert!(after.updated_at >= before.updated_at, "updatedAt regressed");
    assert_eq!(after.last_channel, before.last_channel);
    assert_eq!(after.last_to, before.last_to);
    assert_eq!(after.last_provider, before.last_provider);
}

#[tokio::test]
async fn heartbeat_ok_delivered_when_shown() {
    let (runner, sessions, channel, _dir) =
        heartbeat_harness("<b>HEARTBEAT_OK</b>", Channel::Whatsapp).await;
    sessions
        .update("agent:default:main", |s| {
            s.last_channel = Some(Channel::Whatsapp);
            s.last_to = Some("+491701".into());
        })
        .await
        .unwrap();
    runner.run_once("whatsapp", &visibility(true)).await.unwrap();
    let sends = channel.sends.lock().await.clone();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].1, "HEARTBEAT_OK");
}

#[tokio::test]
async fn heartbeat_skips_when_no_target() {
    let (runner, _sessions, channel, _dir) =
        heartbeat_harness("HEARTBEAT_OK", Channel::Whatsapp).await;
    // No last route, no overrides: nothing to reply to.
    runner.run_once("whatsapp", &visibility(true)).await.unwrap();
    assert!(channel.sends.lock().await.is_empty());
}

#[tokio::test]
async fn telegram_heartbeat_uses_account_id() {
    let (runner, _sessions, channel, _dir) =
        heartbeat_harness("disk space low on media volume", Channel::Telegram).await;
    let hb = HeartbeatConfig {
        every: Some("5m".into()),
        target: Some("telegram".into()),
        to: Some("chat-9".into()),
        account_id: Some("work".into()),
        think: None,
        ack_max_chars: 0,
        visibility: HeartbeatVisibility {
            show_ok: false,
            show_alerts: true,
            use_indicator: false,
        },
    };
    runner.run_once("telegram", &hb).await.unwrap();
    let sends = channel.sends.lock().await.clone();
    assert_eq!(sends.len(), 1, "exactly one telegram send: {:?}", sends);
    assert_eq!(sends[0].0, "chat-9");
    assert_eq!(sends[0].2.as_deref(), Some("work"));
    assert!(sends[0].1.contains("disk space low"));
}
