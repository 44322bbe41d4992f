//! Cron jobs: persisted interval schedules that fire agent prompts as
//! forced-sync admissions. Schedules use the `every:<interval>` form
//! ("every:5m", "every:1h"); `runNow` bypasses the schedule.

use crate::config;
use crate::scheduler::{PromptRequest, RunOrigin, Scheduler};
use crate::session::QueueMode;
use crate::store::{self, JsonFile};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const TICK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    /// `every:<interval>`, e.g. "every:30m".
    pub schedule: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_run_ms: i64,
}

fn default_enabled() -> bool {
    true
}

/// Parse the interval from an `every:` schedule.
pub fn schedule_interval(schedule: &str) -> Option<Duration> {
    schedule
        .trim()
        .strip_prefix("every:")
        .and_then(config::parse_interval)
}

type JobIndex = HashMap<String, CronJob>;

/// Persistent job store at `<state_dir>/cron.json` plus the firing loop.
pub struct CronService {
    file: JsonFile,
    jobs: RwLock<JobIndex>,
    scheduler: Scheduler,
    default_session_key: String,
}

impl CronService {
    pub async fn load(
        state_dir: &std::path::Path,
        scheduler: Scheduler,
        default_session_key: String,
    ) -> Self {
        let file = JsonFile::new(state_dir.join("cron.json"));
        let jobs: JobIndex = file.read().await.ok().flatten().unwrap_or_default();
        Self {
            file,
            jobs: RwLock::new(jobs),
            scheduler,
            default_session_key,
        }
    }

    pub async fn list(&self) -> Vec<CronJob> {
        let g = self.jobs.read().await;
        let mut jobs: Vec<CronJob> = g.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub async fn add(
        &self,
        schedule: String,
        message: String,
        session_key: Option<String>,
    ) -> Result<CronJob> {
        if schedule_interval(&schedule).is_none() {
            anyhow::bail!("invalid schedule: {} (use every:<interval>)", schedule);
        }
        if message.trim().is_empty() {
            anyhow::bail!("cron message must not be empty");
        }
        let job = CronJob {
            id: format!("cron-{}", uuid::Uuid::new_v4()),
            schedule,
            message,
            session_key,
            enabled: true,
            // First fire comes one interval after creation.
            last_run_ms: store::now_ms(),
        };
        let mut g = self.jobs.write().await;
        g.insert(job.id.clone(), job.clone());
        self.file.write(&*g).await?;
        Ok(job)
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut g = self.jobs.write().await;
        let existed = g.remove(id).is_some();
        if existed {
            self.file.write(&*g).await?;
        }
        Ok(existed)
    }

    /// Fire one job immediately, ignoring its schedule.
    pub async fn run_now(&self, id: &str) -> Result<()> {
        let job = {
            let g = self.jobs.read().await;
            g.get(id).cloned()
        };
        let Some(job) = job else {
            anyhow::bail!("unknown cron job: {}", id)
        };
        self.fire(&job).await;
        self.stamp(id).await
    }

    /// Spawn the firing loop.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TICK).await;
                self.tick().await;
            }
        });
    }

    async fn tick(&self) {
        let due: Vec<CronJob> = {
            let g = self.jobs.read().await;
            let now = store::now_ms();
            g.values()
                .filter(|j| j.enabled)
                .filter(|j| {
                    schedule_interval(&j.schedule)
                        .map(|every| now - j.last_run_ms >= every.as_millis() as i64)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        for job in due {
            log::info!("cron job {} due, firing", job.id);
            self.fire(&job).await;
            if let Err(e) = self.stamp(&job.id).await {
                log::warn!("cron stamp failed: {}", e);
            }
        }
    }

    async fn fire(&self, job: &CronJob) {
        let key = job
            .session_key
            .clone()
            .unwrap_or_else(|| self.default_session_key.clone());
        let mut request = PromptRequest::user(&key, &job.message);
        request.origin = RunOrigin::Cron;
        request.forced = true;
        request.queue_mode = QueueMode::Queue;
        self.scheduler.submit(request).await;
    }

    async fn stamp(&self, id: &str) -> Result<()> {
        let mut g = self.jobs.write().await;
        if let Some(j) = g.get_mut(id) {
            j.last_run_ms = store::now_ms();
            self.file.write(&*g).await?;
        }
        Ok(())
    }
}
