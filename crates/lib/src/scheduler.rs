//! Session scheduler: per-session serialization, cross-session concurrency
//! cap, queue/interrupt semantics, and forced-sync admissions.
//!
//! Every session key owns a lane (an mpsc queue plus a worker task). Lanes
//! serialize runs per session; a global fair semaphore caps runs across
//! sessions in FIFO arrival order. In queue mode, messages that piled up
//! behind an in-flight run merge into a single prompt; in interrupt mode a
//! new message cancels the in-flight run via a watch sequence bump. Forced
//! requests (heartbeat, cron, operator sync) occupy a one-slot pending entry
//! per lane: they are guaranteed to run after the current run finishes, and
//! multiple forced requests collapse while the slot is waiting.

use crate::envelope::{Channel, ChatType, MediaAttachment};
use crate::session::{QueueMode, ThinkingLevel, VerboseMode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};

const LANE_BUFFER: usize = 64;

/// Where a prompt came from; delivery and error surfacing differ by origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOrigin {
    User,
    Heartbeat,
    Cron,
    Control,
}

/// Explicit delivery target attached to a request (otherwise the session's
/// last route is used).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRoute {
    pub channel: Channel,
    pub to: String,
    pub account_id: Option<String>,
}

/// One admission request for the scheduler.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// Assigned at submit; a merged batch executes under the first queued id,
    /// a collapsed forced slot under the latest.
    pub run_id: String,
    pub session_key: String,
    /// Chat shape of the originating conversation; group and channel chats
    /// get the one-time primer on their first reply.
    pub chat_type: ChatType,
    /// Sender attribution used when queued messages merge.
    pub from: Option<String>,
    pub body: String,
    pub origin: RunOrigin,
    /// Forced-sync: bypasses debounce windows and occupies the lane's
    /// single pending slot.
    pub forced: bool,
    /// When false, the reply is not sent to any transport.
    pub deliver: bool,
    pub route: Option<DeliveryRoute>,
    /// One-shot thinking override for this run.
    pub thinking: Option<ThinkingLevel>,
    /// One-shot verbose override for this run.
    pub verbose: Option<VerboseMode>,
    /// Prepended to the prompt verbatim (abort reminder, group primer).
    pub body_prefix: Option<String>,
    pub media: Vec<MediaAttachment>,
    /// When set, the executor reports the outcome here (heartbeat filtering).
    pub result_tx: Option<mpsc::Sender<RunOutcome>>,
    /// Resolved at submit time: session override > channel default > global.
    pub queue_mode: QueueMode,
}

impl PromptRequest {
    pub fn user(session_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            run_id: String::new(),
            session_key: session_key.into(),
            chat_type: ChatType::Direct,
            from: None,
            body: body.into(),
            origin: RunOrigin::User,
            forced: false,
            deliver: true,
            route: None,
            thinking: None,
            verbose: None,
            body_prefix: None,
            media: Vec::new(),
            result_tx: None,
            queue_mode: QueueMode::Queue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Streaming,
    Final,
    Failed,
    Cancelled,
}

/// Outcome returned by the executor for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Final { text: String },
    Cancelled,
    Failed { message: String },
}

/// Bookkeeping for one in-flight run.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub session_key: String,
    pub state: RunState,
    pub started_at: Instant,
}

/// Executor context: the merged request, the run id, a cancel watch (bumped
/// on interrupt), and a hook to mark the record streaming on first payload.
pub struct RunContext {
    pub run_id: String,
    pub request: PromptRequest,
    pub cancel: watch::Receiver<u64>,
    records: Arc<Mutex<HashMap<String, RunRecord>>>,
}

impl RunContext {
    /// Record that the run produced its first payload.
    pub async fn mark_streaming(&self) {
        let mut g = self.records.lock().await;
        if let Some(r) = g.get_mut(&self.run_id) {
            if r.state == RunState::Running {
                r.state = RunState::Streaming;
            }
        }
    }
}

/// Executes one run end to end (agent invocation plus delivery). The executor
/// must watch `ctx.cancel` and return `Cancelled` promptly when it fires.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> RunOutcome;
}

enum LaneEvent {
    Prompt(Box<PromptRequest>),
}

struct LaneHandle {
    tx: mpsc::Sender<LaneEvent>,
    interrupt_tx: watch::Sender<u64>,
    forced_slot: Arc<Mutex<Option<PromptRequest>>>,
    forced_notify: Arc<Notify>,
    busy: Arc<AtomicUsize>,
}

struct SchedulerInner {
    executor: Arc<dyn RunExecutor>,
    semaphore: Arc<Semaphore>,
    lanes: Mutex<HashMap<String, Arc<LaneHandle>>>,
    records: Arc<Mutex<HashMap<String, RunRecord>>>,
    in_flight: AtomicUsize,
}

/// The scheduler; cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(executor: Arc<dyn RunExecutor>, max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                executor,
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                lanes: Mutex::new(HashMap::new()),
                records: Arc::new(Mutex::new(HashMap::new())),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Admit a request. Returns the run id it will (eventually) execute
    /// under; queued messages that merge execute under the first queued id.
    pub async fn submit(&self, mut request: PromptRequest) -> String {
        if request.run_id.is_empty() {
            request.run_id = format!("run-{}", uuid::Uuid::new_v4());
        }
        let run_id = request.run_id.clone();
        let lane = self.lane(&request.session_key).await;

        if request.forced {
            // One pending slot per lane; later forced requests collapse into
            // it until the slot is picked up.
            let mut slot = lane.forced_slot.lock().await;
            let collapsed = slot.is_some();
            *slot = Some(request);
            drop(slot);
            lane.forced_notify.notify_one();
            if collapsed {
                log::debug!("forced request collapsed into pending slot");
            }
            return run_id;
        }

        if request.queue_mode == QueueMode::Interrupt && lane.busy.load(Ordering::SeqCst) > 0 {
            lane.interrupt_tx.send_modify(|v| *v += 1);
            log::debug!(
                "interrupt signalled for session {}",
                request.session_key
            );
        }
        if lane
            .tx
            .send(LaneEvent::Prompt(Box::new(request)))
            .await
            .is_err()
        {
            log::warn!("lane queue closed; dropping prompt");
        }
        run_id
    }

    /// Whether a run is currently executing for this session.
    pub async fn is_busy(&self, session_key: &str) -> bool {
        let lanes = self.inner.lanes.lock().await;
        lanes
            .get(session_key)
            .map(|l| l.busy.load(Ordering::SeqCst) > 0)
            .unwrap_or(false)
    }

    /// Count of runs currently executing across all sessions.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of active run records.
    pub async fn active_runs(&self) -> Vec<RunRecord> {
        self.inner.records.lock().await.values().cloned().collect()
    }

    async fn lane(&self, session_key: &str) -> Arc<LaneHandle> {
        let mut lanes = self.inner.lanes.lock().await;
        if let Some(l) = lanes.get(session_key) {
            return l.clone();
        }
        let (tx, rx) = mpsc::channel(LANE_BUFFER);
        let (interrupt_tx, interrupt_rx) = watch::channel(0u64);
        let handle = Arc::new(LaneHandle {
            tx,
            interrupt_tx,
            forced_slot: Arc::new(Mutex::new(None)),
            forced_notify: Arc::new(Notify::new()),
            busy: Arc::new(AtomicUsize::new(0)),
        });
        lanes.insert(session_key.to_string(), handle.clone());
        let inner = self.inner.clone();
        let lane = handle.clone();
        let key = session_key.to_string();
        tokio::spawn(async move {
            run_lane(inner, lane, key, rx, interrupt_rx).await;
        });
        handle
    }
}

/// Merge queued messages into one prompt, newline-joined in arrival order
/// with per-message sender attribution.
fn merge_bodies(batch: &[PromptRequest]) -> String {
    if batch.len() == 1 {
        return batch[0].body.clone();
    }
    batch
        .iter()
        .map(|r| match &r.from {
            Some(from) => format!("{}: {}", from, r.body),
            None => r.body.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_lane(
    inner: Arc<SchedulerInner>,
    lane: Arc<LaneHandle>,
    session_key: String,
    mut rx: mpsc::Receiver<LaneEvent>,
    mut interrupt_rx: watch::Receiver<u64>,
) {
    log::debug!("lane started for session {}", session_key);
    let mut carry: Option<PromptRequest> = None;
    loop {
        // Forced slot has priority once the previous run finished.
        let forced = lane.forced_slot.lock().await.take();
        let request = if let Some(req) = forced {
            req
        } else if let Some(req) = carry.take() {
            req
        } else {
            tokio::select! {
                evt = rx.recv() => match evt {
                    Some(LaneEvent::Prompt(req)) => *req,
                    None => break,
                },
                _ = lane.forced_notify.notified() => continue,
            }
        };

        // Queue mode: drain whatever piled up and merge it into this prompt.
        let request = if !request.forced && request.queue_mode == QueueMode::Queue {
            let mut batch = vec![request];
            while let Ok(LaneEvent::Prompt(next)) = rx.try_recv() {
                let next = *next;
                if next.queue_mode != QueueMode::Queue {
                    carry = Some(next);
                    break;
                }
                batch.push(next);
            }
            let mut merged = batch[0].clone();
            merged.body = merge_bodies(&batch);
            merged
        } else {
            request
        };

        execute_one(&inner, &lane, &session_key, request, &mut interrupt_rx).await;
    }
    log::debug!("lane stopped for session {}", session_key);
}

async fn execute_one(
    inner: &Arc<SchedulerInner>,
    lane: &Arc<LaneHandle>,
    session_key: &str,
    request: PromptRequest,
    interrupt_rx: &mut watch::Receiver<u64>,
) {
    let run_id = request.run_id.clone();
    {
        let mut records = inner.records.lock().await;
        records.insert(
            run_id.clone(),
            RunRecord {
                run_id: run_id.clone(),
                session_key: session_key.to_string(),
                state: RunState::Pending,
                started_at: Instant::now(),
            },
        );
    }

    // Global FIFO admission under the concurrency cap.
    let permit = inner.semaphore.clone().acquire_owned().await;
    let Ok(_permit) = permit else { return };

    lane.busy.fetch_add(1, Ordering::SeqCst);
    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    {
        let mut records = inner.records.lock().await;
        if let Some(r) = records.get_mut(&run_id) {
            r.state = RunState::Running;
        }
    }

    // Interrupts observed from here on cancel this run.
    let observed = *interrupt_rx.borrow_and_update();
    let (cancel_tx, cancel_rx) = watch::channel(0u64);
    let ctx = RunContext {
        run_id: run_id.clone(),
        request,
        cancel: cancel_rx,
        records: inner.records.clone(),
    };

    let exec = inner.executor.clone();
    let mut exec_fut = Box::pin(exec.execute(ctx));
    let outcome = loop {
        tokio::select! {
            outcome = &mut exec_fut => break outcome,
            changed = interrupt_rx.changed() => {
                if changed.is_err() {
                    break exec_fut.await;
                }
                if *interrupt_rx.borrow_and_update() > observed {
                    log::info!("run {} interrupted by newer message", run_id);
                    let _ = cancel_tx.send(1);
                    // The executor resolves the run (usually Cancelled).
                    break exec_fut.await;
                }
            }
        }
    };

    let state = match &outcome {
        RunOutcome::Final { .. } => RunState::Final,
        RunOutcome::Cancelled => RunState::Cancelled,
        RunOutcome::Failed { .. } => RunState::Failed,
    };
    {
        let mut records = inner.records.lock().await;
        if let Some(r) = records.get_mut(&run_id) {
            r.state = state;
        }
        records.remove(&run_id);
    }
    lane.busy.fetch_sub(1, Ordering::SeqCst);
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);
}

/// Coalesces bursts of non-chat operations (index refresh, probe sweeps) into
/// one call carrying the latest reason. `force` bypasses the quiet window.
pub struct Debouncer {
    tx: mpsc::Sender<(String, bool)>,
}

impl Debouncer {
    pub fn new<F>(window: Duration, mut f: F) -> Self
    where
        F: FnMut(String) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<(String, bool)>(64);
        tokio::spawn(async move {
            loop {
                let Some((mut reason, force)) = rx.recv().await else {
                    break;
                };
                if !force {
                    // Quiet window: keep absorbing calls, remember the latest
                    // reason; a forced call flushes immediately.
                    loop {
                        match tokio::time::timeout(window, rx.recv()).await {
                            Ok(Some((r, f2))) => {
                                reason = r;
                                if f2 {
                                    break;
                                }
                            }
                            Ok(None) => return,
                            Err(_) => break,
                        }
                    }
                }
                f(reason);
            }
        });
        Self { tx }
    }

    pub async fn call(&self, reason: impl Into<String>, force: bool) {
        let _ = self.tx.send((reason.into(), force)).await;
    }
}
