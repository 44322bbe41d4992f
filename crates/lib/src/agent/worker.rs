//! Agent worker supervision: one long-lived subprocess speaking NDJSON over
//! stdio. A single supervisor task owns the child, writes request frames, and
//! demuxes event frames by runId to per-run subscribers. Crashes restart the
//! worker with bounded exponential backoff (250 ms → 30 s, reset after 60 s
//! healthy); runs pending at crash time are failed, not retried.

use crate::agent::protocol::{RunRequest, WorkerEvent, WorkerRequest};
use crate::session::ThinkingLevel;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;

const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const HEALTHY_AFTER: Duration = Duration::from_secs(60);
const EVENT_BUFFER: usize = 256;

/// Cue token appended to the prompt when the worker does not take a thinking
/// argument. `minimal` maps to the empty string (no cue).
pub fn cue_token(level: ThinkingLevel) -> &'static str {
    match level {
        ThinkingLevel::Off | ThinkingLevel::Minimal => "",
        ThinkingLevel::Low => "think",
        ThinkingLevel::Medium => "think hard",
        ThinkingLevel::High => "think harder",
        ThinkingLevel::Max => "ultrathink",
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// argv for the worker; empty disables the adapter (runs fail fast).
    pub cmd: Vec<String>,
    /// Worker accepts the per-run thinking field natively. When false, the
    /// adapter rewrites the body with a cue token and sends thinking=off.
    pub thinking_cli_arg: bool,
    /// Grace between soft cancel and SIGTERM, and SIGTERM and SIGKILL.
    pub cancel_grace_ms: u64,
}

enum Command {
    Run {
        frame: RunRequest,
        events: mpsc::Sender<WorkerEvent>,
    },
    Cancel {
        run_id: String,
    },
}

/// Handle to the supervised worker. Cloneable; all clones feed the same
/// supervisor task.
#[derive(Clone)]
pub struct AgentWorker {
    cmd_tx: mpsc::Sender<Command>,
    thinking_cli_arg: bool,
}

impl AgentWorker {
    /// Spawn the supervisor task. The subprocess itself starts lazily on the
    /// first run request.
    pub fn start(config: WorkerConfig) -> Self {
        let thinking_cli_arg = config.thinking_cli_arg;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        tokio::spawn(supervise(config, cmd_rx));
        Self {
            cmd_tx,
            thinking_cli_arg,
        }
    }

    /// Submit a run; events for this run arrive on the returned receiver,
    /// terminated by an `agent_end` frame (synthesized on crash).
    pub async fn run(&self, mut frame: RunRequest) -> Result<mpsc::Receiver<WorkerEvent>> {
        if !self.thinking_cli_arg {
            let cue = cue_token(frame.thinking);
            if !cue.is_empty() {
                frame.body = format!("{}\n\n{}", frame.body, cue);
            }
            frame.thinking = ThinkingLevel::Off;
        }
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.cmd_tx
            .send(Command::Run { frame, events: tx })
            .await
            .map_err(|_| anyhow::anyhow!("agent worker supervisor gone"))?;
        Ok(rx)
    }

    /// Soft-cancel a run. The supervisor escalates to SIGTERM then SIGKILL if
    /// the worker does not resolve the run within the grace window.
    pub async fn cancel(&self, run_id: &str) {
        let _ = self
            .cmd_tx
            .send(Command::Cancel {
                run_id: run_id.to_string(),
            })
            .await;
    }
}

struct Subscriber {
    tx: mpsc::Sender<WorkerEvent>,
    cancel_requested_at: Option<Instant>,
    sigtermed: bool,
}

struct ChildHandle {
    child: Child,
    stdin: ChildStdin,
    lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    spawned_at: Instant,
}

async fn supervise(config: WorkerConfig, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut subs: HashMap<String, Subscriber> = HashMap::new();
    let mut handle: Option<ChildHandle> = None;
    let mut backoff = BACKOFF_MIN;
    let mut next_spawn_ok = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(250));
    let grace = Duration::from_millis(config.cancel_grace_ms.max(1));

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Run { frame, events } => {
                        if config.cmd.is_empty() {
                            let _ = events
                                .send(WorkerEvent::Error {
                                    run_id: frame.run_id.clone(),
                                    message: "no agent worker configured".to_string(),
                                    kind: Some("config".to_string()),
                                })
                                .await;
                            let _ = events
                                .send(WorkerEvent::AgentEnd { run_id: frame.run_id })
                                .await;
                            continue;
                        }
                        if handle.is_none() {
                            // Respect the restart backoff before respawning.
                            let now = Instant::now();
                            if now < next_spawn_ok {
                                tokio::time::sleep(next_spawn_ok - now).await;
                            }
                            match spawn_child(&config) {
                                Ok(h) => {
                                    log::info!("agent worker started (pid {:?})", h.child.id());
                                    handle = Some(h);
                                }
                                Err(e) => {
                                    log::warn!("agent worker spawn failed: {}", e);
                                    let _ = events
                                        .send(WorkerEvent::Error {
                                            run_id: frame.run_id.clone(),
                                            message: "agent worker unavailable".to_string(),
                                            kind: Some("worker-crash".to_string()),
                                        })
                                        .await;
                                    let _ = events
                                        .send(WorkerEvent::AgentEnd { run_id: frame.run_id })
                                        .await;
                                    next_spawn_ok = Instant::now() + backoff;
                                    backoff = (backoff * 2).min(BACKOFF_MAX);
                                    continue;
                                }
                            }
                        }
                        let run_id = frame.run_id.clone();
                        subs.insert(
                            run_id.clone(),
                            Subscriber { tx: events, cancel_requested_at: None, sigtermed: false },
                        );
                        let h = handle.as_mut().unwrap();
                        if let Err(e) = write_frame(&mut h.stdin, &WorkerRequest::Run(frame)).await {
                            log::warn!("agent worker stdin write failed: {}", e);
                            child_down(&mut handle, &mut subs, &mut backoff, &mut next_spawn_ok).await;
                        }
                    }
                    Command::Cancel { run_id } => {
                        if let Some(sub) = subs.get_mut(&run_id) {
                            sub.cancel_requested_at = Some(Instant::now());
                        }
                        if let Some(h) = handle.as_mut() {
                            let frame = WorkerRequest::Cancel { run_id };
                            if let Err(e) = write_frame(&mut h.stdin, &frame).await {
                                log::warn!("agent worker cancel write failed: {}", e);
                                child_down(&mut handle, &mut subs, &mut backoff, &mut next_spawn_ok).await;
                            }
                        }
                    }
                }
            }

            line = read_line(&mut handle), if handle.is_some() => {
                match line {
                    Some(Ok(line)) => {
                        route_line(&line, &mut subs).await;
                        // A healthy stretch resets the restart backoff.
                        if let Some(h) = handle.as_ref() {
                            if h.spawned_at.elapsed() > HEALTHY_AFTER {
                                backoff = BACKOFF_MIN;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("agent worker stdout read failed: {}", e);
                        child_down(&mut handle, &mut subs, &mut backoff, &mut next_spawn_ok).await;
                    }
                    None => {
                        log::warn!("agent worker exited");
                        child_down(&mut handle, &mut subs, &mut backoff, &mut next_spawn_ok).await;
                    }
                }
            }

            _ = tick.tick() => {
                escalate_cancels(&mut handle, &mut subs, grace).await;
            }
        }
    }
}

fn spawn_child(config: &WorkerConfig) -> Result<ChildHandle> {
    let (bin, args) = config
        .cmd
        .split_first()
        .context("agent.workerCmd is empty")?;
    let mut child = tokio::process::Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning agent worker {}", bin))?;
    let stdin = child.stdin.take().context("agent worker has no stdin")?;
    let stdout = child.stdout.take().context("agent worker has no stdout")?;
    Ok(ChildHandle {
        child,
        stdin,
        lines: BufReader::new(stdout).lines(),
        spawned_at: Instant::now(),
    })
}

async fn read_line(handle: &mut Option<ChildHandle>) -> Option<std::io::Result<String>> {
    match handle.as_mut() {
        Some(h) => h.lines.next_line().await.transpose(),
        None => std::future::pending().await,
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &WorkerRequest) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn route_line(line: &str, subs: &mut HashMap<String, Subscriber>) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let event: WorkerEvent = match serde_json::from_str(trimmed) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("agent worker emitted unparseable line: {}", e);
            return;
        }
    };
    let run_id = event.run_id().to_string();
    let terminal = event.is_terminal();
    if let Some(sub) = subs.get(&run_id) {
        let _ = sub.tx.send(event).await;
    } else {
        log::debug!("agent worker event for unknown run {}", run_id);
    }
    if terminal {
        subs.remove(&run_id);
    }
}

/// Fail every pending run with a crash error and a terminal frame.
async fn fail_all(subs: &mut HashMap<String, Subscriber>, message: &str) {
    for (run_id, sub) in subs.drain() {
        let _ = sub
            .tx
            .send(WorkerEvent::Error {
                run_id: run_id.clone(),
                message: message.to_string(),
                kind: Some("worker-crash".to_string()),
            })
            .await;
        let _ = sub.tx.send(WorkerEvent::AgentEnd { run_id }).await;
    }
}

async fn child_down(
    handle: &mut Option<ChildHandle>,
    subs: &mut HashMap<String, Subscriber>,
    backoff: &mut Duration,
    next_spawn_ok: &mut Instant,
) {
    if let Some(mut h) = handle.take() {
        let _ = h.child.start_kill();
        if h.spawned_at.elapsed() > HEALTHY_AFTER {
            *backoff = BACKOFF_MIN;
        }
    }
    fail_all(subs, "agent worker exited").await;
    *next_spawn_ok = Instant::now() + *backoff;
    *backoff = (*backoff * 2).min(BACKOFF_MAX);
}

/// Cancelled runs that outlive the grace window take the worker down with
/// them: SIGTERM first, SIGKILL one more grace later.
async fn escalate_cancels(
    handle: &mut Option<ChildHandle>,
    subs: &mut HashMap<String, Subscriber>,
    grace: Duration,
) {
    let Some(h) = handle.as_mut() else { return };
    let mut kill = false;
    for sub in subs.values_mut() {
        let Some(at) = sub.cancel_requested_at else {
            continue;
        };
        if !sub.sigtermed && at.elapsed() >= grace {
            sub.sigtermed = true;
            sigterm(&h.child);
        } else if sub.sigtermed && at.elapsed() >= grace * 2 {
            kill = true;
        }
    }
    if kill {
        log::warn!("agent worker ignored cancel; killing");
        let _ = h.child.start_kill();
    }
}

#[cfg(unix)]
fn sigterm(child: &Child) {
    if let Some(pid) = child.id() {
        log::warn!("agent worker ignored cancel; sending SIGTERM");
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn sigterm(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cue_tokens_match_levels() {
        assert_eq!(cue_token(ThinkingLevel::Off), "");
        assert_eq!(cue_token(ThinkingLevel::Minimal), "");
        assert_eq!(cue_token(ThinkingLevel::Low), "think");
        assert_eq!(cue_token(ThinkingLevel::Medium), "think hard");
        assert_eq!(cue_token(ThinkingLevel::High), "think harder");
        assert_eq!(cue_token(ThinkingLevel::Max), "ultrathink");
    }

    #[tokio::test]
    async fn empty_worker_cmd_fails_runs_fast() {
        let worker = AgentWorker::start(WorkerConfig {
            cmd: Vec::new(),
            thinking_cli_arg: true,
            cancel_grace_ms: 100,
        });
        let mut rx = worker
            .run(
                crate::agent::RunRequest {
                    run_id: "r1".into(),
                    session_key: "k".into(),
                    session_id: None,
                    system_prompt: None,
                    body_prefix: None,
                    body: "hi".into(),
                    thinking: ThinkingLevel::Off,
                    media: Vec::new(),
                    model_ref: "m".into(),
                    timeout_ms: 1000,
                })
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WorkerEvent::Error { .. }));
        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
    }

    #[tokio::test]
    async fn echo_worker_round_trips_events() {
        // `cat` echoes request frames; a run frame is not a valid event, so
        // feed a real worker script instead: use /bin/sh to emit a scripted
        // final + agent_end for any line read.
        let script = r#"while IFS= read -r line; do
            id=$(printf '%s' "$line" | sed -n 's/.*"runId":"\([^"]*\)".*/\1/p')
            printf '{"type":"final","runId":"%s","text":"pong"}\n' "$id"
            printf '{"type":"agent_end","runId":"%s"}\n' "$id"
        done"#;
        let worker = AgentWorker::start(WorkerConfig {
            cmd: vec!["/bin/sh".into(), "-c".into(), script.into()],
            thinking_cli_arg: true,
            cancel_grace_ms: 100,
        });
        let mut rx = worker
            .run(
                crate::agent::RunRequest {
                    run_id: "r42".into(),
                    session_key: "k".into(),
                    session_id: None,
                    system_prompt: None,
                    body_prefix: None,
                    body: "ping".into(),
                    thinking: ThinkingLevel::Off,
                    media: Vec::new(),
                    model_ref: "m".into(),
                    timeout_ms: 1000,
                })
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            WorkerEvent::Final {
                run_id: "r42".into(),
                text: "pong".into(),
                usage: None
            }
        );
        let second = rx.recv().await.unwrap();
        assert!(second.is_terminal());
    }
}
