//! End-to-end pipeline scenarios: a scripted shell worker stands in for the
//! agent backend, a recording channel stands in for the transport. No network.

use async_trait::async_trait;
use lib::agent::{AgentWorker, WorkerConfig};
use lib::channels::{ChannelHandle, ChannelRegistry, SendOptions};
use lib::config::{Config, ConfigHandle};
use lib::envelope::{Channel, ChatType, Envelope};
use lib::pipeline::{AgentExecutor, Pipeline, PipelineContext};
use lib::scheduler::Scheduler;
use lib::session::{SessionStore, ThinkingLevel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Worker that echoes the thinking level, body prefix, and body of each run
/// frame back in the final text. Bodies containing "SLOW" are answered after
/// a delay so interrupts can land.
const ECHO_WORKER: &str = r#"while IFS= read -r line; do
    case "$line" in
        *'"type":"run"'*) ;;
        *) continue ;;
    esac
    id=$(printf '%s' "$line" | sed -n 's/.*"runId":"\([^"]*\)".*/\1/p')
    th=$(printf '%s' "$line" | sed -n 's/.*"thinking":"\([^"]*\)".*/\1/p')
    body=$(printf '%s' "$line" | sed -n 's/.*"body":"\([^"]*\)".*/\1/p')
    prefix=$(printf '%s' "$line" | sed -n 's/.*"bodyPrefix":"\([^"]*\)".*/\1/p')
    case "$body" in
        *SLOW*) sleep 2 ;;
    esac
    printf '{"type":"session_start","runId":"%s","sessionId":"sess-test"}\n' "$id"
    printf '{"type":"final","runId":"%s","text":"reply thinking=%s prefix=[%s] body=[%s]"}\n' "$id" "$th" "$prefix" "$body"
    printf '{"type":"agent_end","runId":"%s"}\n' "$id"
done"#;

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

    async fn sent(&self) -> Vec<(String, String, Option<String>)> {
        self.sends.lock().await.clone()
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

struct Harness {
    pipeline: Arc<Pipeline>,
    ctx: Arc<PipelineContext>,
    sessions: Arc<SessionStore>,
    channel: Arc<RecordingChannel>,
    _dir: tempfile::TempDir,
}

async fn harness(mut config: Config, channel: Channel) -> Harness {
    config.agent.worker_cmd = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        ECHO_WORKER.to_string(),
    ];
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionStore::load(dir.path()).await);
    let registry = Arc::new(ChannelRegistry::new());
    let recording = RecordingChannel::new(channel);
    registry.register(recording.clone()).await;

    // Generous cancel grace: the scripted worker ignores cancel frames and
    // resolves runs on its own; escalation would kill it mid-test.
    let worker = AgentWorker::start(WorkerConfig {
        cmd: config.agent.worker_cmd.clone(),
        thinking_cli_arg: true,
        cancel_grace_ms: 5_000,
    });
    let (event_tx, _) = broadcast::channel(64);
    let ctx = Arc::new(PipelineContext {
        config: ConfigHandle::new(config, dir.path().join("config.json")),
        sessions: sessions.clone(),
        registry,
        worker,
        event_tx,
    });
    let executor = Arc::new(AgentExecutor::new(ctx.clone()));
    let scheduler = Scheduler::new(executor, 4);
    let pipeline = Arc::new(Pipeline::new(ctx.clone(), scheduler));
    Harness {
        pipeline,
        ctx,
        sessions,
        channel: recording,
        _dir: dir,
    }
}

fn direct_envelope(channel: Channel, from: &str, body: &str) -> Envelope {
    Envelope::text(channel, "test", from, ChatType::Direct, from, body)
}

fn group_envelope(body: &str) -> Envelope {
    Envelope::text(
        Channel::Whatsapp,
        "whatsapp-web",
        "+4917012345",
        ChatType::Group,
        "group-1",
        body,
    )
}

async fn wait_for_sends(channel: &RecordingChannel, n: usize) {
    for _ in 0..100 {
        if channel.sends.lock().await.len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn allow_all(config: &mut Config, channel: Channel) {
    match channel {
        Channel::Whatsapp => config.channels.whatsapp.allow_from = vec!["*".into()],
        Channel::Telegram => config.channels.telegram.common.allow_from = vec!["*".into()],
        Channel::Discord => config.channels.discord.allow_from = vec!["*".into()],
        Channel::Webchat | Channel::Node => {
            config.channels.webchat.allow_from = vec!["*".into()]
        }
    }
}

#[tokio::test]
async fn thinking_pin_sets_session_and_applies_to_next_run() {
    let mut config = Config::default();
    allow_all(&mut config, Channel::Telegram);
    let h = harness(config, Channel::Telegram).await;

    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "42", "/think high"))
        .await;
    wait_for_sends(&h.channel, 1).await;
    let sends = h.channel.sent().await;
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].1, "Thinking level set to high.");

    let key = "agent:default:telegram:direct:42";
    let session = h.sessions.get(key).await;
    assert_eq!(session.thinking_level, ThinkingLevel::High);

    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "42", "hi"))
        .await;
    wait_for_sends(&h.channel, 2).await;
    let sends = h.channel.sent().await;
    assert_eq!(sends.len(), 2, "sends: {:?}", sends);
    assert!(
        sends[1].1.contains("thinking=high"),
        "agent did not observe the pinned level: {}",
        sends[1].1
    );
    assert!(sends[1].1.contains("body=[hi]"));
}

#[tokio::test]
async fn group_mention_gating_and_interrupt() {
    // allowFrom empty; activation defaults to mention-required.
    let mut config = Config::default();
    config.channels.whatsapp.bot_ids = vec!["bot".into()];
    let h = harness(config, Channel::Whatsapp).await;

    // No mention: no run, no reply.
    h.pipeline.handle_envelope(group_envelope("hello")).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.channel.sent().await.is_empty());

    // Mentioned: run starts (SLOW keeps it in flight).
    h.pipeline
        .handle_envelope(group_envelope("@bot SLOW hello"))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.channel.sent().await.is_empty(), "still in flight");

    // Second mention interrupts (WhatsApp defaults to interrupt); the reply
    // carries only the new message.
    h.pipeline
        .handle_envelope(group_envelope("@bot ping"))
        .await;
    wait_for_sends(&h.channel, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let sends = h.channel.sent().await;
    assert_eq!(sends.len(), 1, "exactly one reply: {:?}", sends);
    assert!(sends[0].1.contains("body=[@bot ping]"), "{}", sends[0].1);
    // The completed turn primes the group.
    let session = h
        .sessions
        .get("agent:default:whatsapp:group:group-1")
        .await;
    assert!(session.primed);
}

#[tokio::test]
async fn discord_channel_chat_gets_primer_and_primes() {
    // Guild messages normalize to ChatType::Channel, not Group; they are
    // multi-party all the same and get the one-time primer.
    let mut config = Config::default();
    config.channels.discord.allow_from = vec!["*".into()];
    config.channels.discord.bot_ids = vec!["bot".into()];
    let h = harness(config, Channel::Discord).await;

    let envelope = Envelope::text(
        Channel::Discord,
        "discord-bot",
        "u1",
        ChatType::Channel,
        "g1:c1",
        "@bot hi",
    );
    h.pipeline.handle_envelope(envelope).await;
    wait_for_sends(&h.channel, 1).await;
    let sends = h.channel.sent().await;
    assert_eq!(sends.len(), 1, "sends: {:?}", sends);
    assert!(
        sends[0]
            .1
            .contains("prefix=[You are replying inside the group conversation g1:c1"),
        "missing primer: {}",
        sends[0].1
    );

    let key = "agent:default:discord:channel:g1:c1";
    assert!(h.sessions.get(key).await.primed);

    // Second turn: primer is not repeated.
    h.pipeline
        .handle_envelope(Envelope::text(
            Channel::Discord,
            "discord-bot",
            "u1",
            ChatType::Channel,
            "g1:c1",
            "@bot again",
        ))
        .await;
    wait_for_sends(&h.channel, 2).await;
    let sends = h.channel.sent().await;
    assert!(
        sends[1].1.contains("prefix=[]"),
        "primer must not repeat: {}",
        sends[1].1
    );
}

#[tokio::test]
async fn stop_word_aborts_and_next_prompt_carries_reminder() {
    let mut config = Config::default();
    allow_all(&mut config, Channel::Telegram);
    let h = harness(config, Channel::Telegram).await;
    let key = "agent:default:telegram:direct:7";

    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "7", "abort"))
        .await;
    wait_for_sends(&h.channel, 1).await;
    let sends = h.channel.sent().await;
    assert_eq!(sends[0].1, "Agent was aborted.");
    assert!(h.sessions.get(key).await.aborted);

    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "7", "hi again"))
        .await;
    wait_for_sends(&h.channel, 2).await;
    let sends = h.channel.sent().await;
    assert!(
        sends[1].1.contains("prefix=[Note: the previous run was aborted"),
        "missing abort reminder: {}",
        sends[1].1
    );
    assert!(!h.sessions.get(key).await.aborted, "flag must clear");
}

#[tokio::test]
async fn directive_only_messages_reply_exact_confirmation() {
    let mut config = Config::default();
    allow_all(&mut config, Channel::Telegram);
    let h = harness(config, Channel::Telegram).await;

    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "1", "/queue interrupt"))
        .await;
    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "1", "/think enormous"))
        .await;
    wait_for_sends(&h.channel, 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sends = h.channel.sent().await;
    let texts: Vec<&str> = sends.iter().map(|s| s.1.as_str()).collect();
    assert!(texts.contains(&"Queue mode set to interrupt."));
    assert!(texts
        .iter()
        .any(|t| t.starts_with("Usage: /think")), "hint missing: {:?}", texts);
    // No agent run for either message.
    assert_eq!(sends.len(), 2);
}

#[tokio::test]
async fn unauthorized_direct_message_never_runs() {
    let config = Config::default(); // empty allowlists
    let h = harness(config, Channel::Telegram).await;
    h.pipeline
        .handle_envelope(direct_envelope(Channel::Telegram, "99", "hi"))
        .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(h.channel.sent().await.is_empty());
    assert_eq!(h.pipeline.scheduler().in_flight(), 0);
}

#[tokio::test]
async fn failed_media_degrades_to_caption_with_warning() {
    use lib::envelope::{MediaAttachment, MediaKind};
    use lib::scheduler::DeliveryRoute;

    let mut config = Config::default();
    allow_all(&mut config, Channel::Telegram);
    let h = harness(config, Channel::Telegram).await;

    // RecordingChannel has no media support, so the send degrades.
    let media = MediaAttachment {
        kind: MediaKind::Image,
        url: Some("https://example/img.jpg".into()),
        bytes: None,
        mime: "image/jpeg".into(),
        size_bytes: 1024,
        caption: None,
    };
    let route = DeliveryRoute {
        channel: Channel::Telegram,
        to: "42".into(),
        account_id: None,
    };
    lib::pipeline::deliver_media(&h.ctx, &route, &media, Some("holiday photo"))
        .await
        .unwrap();
    let sends = h.channel.sent().await;
    assert_eq!(sends.len(), 1);
    assert!(sends[0].1.starts_with("holiday photo\n"));
    assert!(sends[0].1.contains("attachment could not be sent"));
}

#[tokio::test]
async fn duplicate_message_ids_are_dropped() {
    let mut config = Config::default();
    allow_all(&mut config, Channel::Telegram);
    let h = harness(config, Channel::Telegram).await;

    let mut e1 = direct_envelope(Channel::Telegram, "5", "hi");
    e1.message_id = "same-id".into();
    let mut e2 = direct_envelope(Channel::Telegram, "5", "hi");
    e2.message_id = "same-id".into();
    h.pipeline.handle_envelope(e1).await;
    h.pipeline.handle_envelope(e2).await;
    wait_for_sends(&h.channel, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.channel.sent().await.len(), 1);
}
