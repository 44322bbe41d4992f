//! Per-conversation session state and its persistent store.
//!
//! Sessions are keyed by `agent:<agentId>:<channel>:<chatType>:<chatKey>`
//! (direct chats optionally collapse into `main`). The store holds the whole
//! index in memory and flushes `sessions.json` through a read-modify-write
//! merge that keeps `updatedAt` monotonic even with concurrent writers.

use crate::envelope::{Channel, ChatType};
use crate::store::{self, JsonFile};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Session pin for reasoning depth, settable via `/think`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Max,
}

impl ThinkingLevel {
    pub fn parse(s: &str) -> Option<ThinkingLevel> {
        match s.trim().to_lowercase().as_str() {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "max" => Some(ThinkingLevel::Max),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Max => "max",
        }
    }
}

/// Session pin for tool-event forwarding, settable via `/verbose`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerboseMode {
    #[default]
    Off,
    On,
    Full,
}

impl VerboseMode {
    pub fn parse(s: &str) -> Option<VerboseMode> {
        match s.trim().to_lowercase().as_str() {
            "off" => Some(VerboseMode::Off),
            "on" => Some(VerboseMode::On),
            "full" => Some(VerboseMode::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VerboseMode::Off => "off",
            VerboseMode::On => "on",
            VerboseMode::Full => "full",
        }
    }
}

/// Scheduler admission policy for new inbound while a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    Queue,
    Interrupt,
}

/// Group activation: reply only when mentioned, or always.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Mention,
    Always,
}

/// Persistent per-conversation state. Unknown keys written by newer builds are
/// preserved across read-modify-write cycles via the flattened `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque id returned by the agent runtime on its first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,

    #[serde(default)]
    pub thinking_level: ThinkingLevel,

    #[serde(default)]
    pub verbose: VerboseMode,

    /// Session queue/interrupt override; None inherits channel/global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_mode: Option<QueueMode>,

    /// Groups only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation: Option<Activation>,

    /// Session model override set via `/model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_override: Option<String>,

    /// Set by a stop word; the next prompt carries an abort reminder and clears it.
    #[serde(default)]
    pub aborted: bool,

    /// Wall-clock millis; never moves backward.
    #[serde(default)]
    pub updated_at: i64,

    /// Last reported token usage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_used: Option<u64>,

    /// Groups: whether the roster/subject primer went out on the first turn.
    #[serde(default)]
    pub primed: bool,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Derive the canonical session key. Direct chats collapse to `main` when the
/// config says so; groups and channels never collapse.
pub fn session_key(
    agent_id: &str,
    channel: Channel,
    chat_type: ChatType,
    chat_key: &str,
    collapse_direct: bool,
) -> String {
    if collapse_direct && chat_type == ChatType::Direct {
        return format!("agent:{}:main", agent_id);
    }
    format!(
        "agent:{}:{}:{}:{}",
        agent_id,
        channel.as_str(),
        chat_type.as_str(),
        chat_key
    )
}

/// One transcript line in `sessions/<sessionKey>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub role: String,
    pub content: String,
    pub at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

type SessionIndex = HashMap<String, Session>;

/// Persistent session store: in-memory index, flushed atomically to
/// `sessions.json`. All writers funnel through [`SessionStore::update`] /
/// [`SessionStore::update_quiet`], which re-read the on-disk copy and take the
/// max `updatedAt` before flushing.
pub struct SessionStore {
    file: JsonFile,
    transcripts_dir: PathBuf,
    inner: RwLock<SessionIndex>,
}

impl SessionStore {
    /// Load the index from `<state_dir>/sessions.json`; missing file starts empty.
    pub async fn load(state_dir: &std::path::Path) -> Self {
        let file = JsonFile::new(state_dir.join("sessions.json"));
        let index: SessionIndex = file.read().await.ok().flatten().unwrap_or_default();
        Self {
            file,
            transcripts_dir: state_dir.join("sessions"),
            inner: RwLock::new(index),
        }
    }

    /// Snapshot of one session (default when absent; sessions are created
    /// lazily on first authorized inbound).
    pub async fn get(&self, key: &str) -> Session {
        self.inner.read().await.get(key).cloned().unwrap_or_default()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Mutate a session and advance `updatedAt` to max(now, on-disk). Use for
    /// writes that complete a turn.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        self.write_merged(key, f, true).await
    }

    /// Mutate a session without advancing `updatedAt` (heartbeat writes). The
    /// merge still takes the max of in-memory and on-disk `updatedAt`.
    pub async fn update_quiet<F>(&self, key: &str, f: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        self.write_merged(key, f, false).await
    }

    async fn write_merged<F>(&self, key: &str, f: F, advance: bool) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut index = self.inner.write().await;
        let mut session = index.get(key).cloned().unwrap_or_default();
        f(&mut session);

        let key_owned = key.to_string();
        let session_for_merge = session.clone();
        let index_snapshot = index.clone();
        let merged = self
            .file
            .update(move |on_disk: Option<SessionIndex>| {
                let mut disk = on_disk.unwrap_or_default();
                let mut next = session_for_merge;
                // updatedAt never moves backward: merge with the on-disk copy.
                if let Some(prev) = disk.get(&key_owned) {
                    next.updated_at = next.updated_at.max(prev.updated_at);
                }
                if advance {
                    next.updated_at = next.updated_at.max(store::now_ms());
                }
                disk.insert(key_owned.clone(), next);
                // Carry sessions this process knows about but the disk copy lost.
                for (k, v) in index_snapshot {
                    disk.entry(k).or_insert(v);
                }
                disk
            })
            .await?;
        let result = merged
            .get(key)
            .cloned()
            .unwrap_or_default();
        *index = merged;
        Ok(result)
    }

    /// Append a transcript line for this session.
    pub async fn append_transcript(&self, key: &str, entry: &TranscriptEntry) -> Result<()> {
        let path = self.transcript_path(key);
        store::append_jsonl(&path, entry).await
    }

    /// Read the transcript for `chat.history`.
    pub async fn read_transcript(&self, key: &str) -> Result<Vec<TranscriptEntry>> {
        store::read_jsonl(&self.transcript_path(key)).await
    }

    fn transcript_path(&self, key: &str) -> PathBuf {
        // Session keys contain ':'; keep filenames portable.
        let name = key.replace([':', '/'], "_");
        self.transcripts_dir.join(format!("{}.jsonl", name))
    }
}
