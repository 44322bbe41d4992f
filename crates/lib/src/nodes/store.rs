//! Paired-node records: persisted pairing tokens, capabilities, and liveness
//! stamps for companion devices. Tokens live only in
//! `bridge/paired-nodes.json`; every outward projection (nodes.list, events,
//! logs) goes through the redacted [`NodeView`].

use crate::store::{self, JsonFile};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One paired companion device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairedNode {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_identifier: Option<String>,

    /// 128-bit pairing secret, hex-encoded. Never logged, never emitted.
    pub token: String,

    /// Capabilities the node declared at pairing (canvas, camera, voiceWake).
    #[serde(default)]
    pub caps: Vec<String>,

    /// RPC method names the node accepts.
    #[serde(default)]
    pub commands: Vec<String>,

    pub created_at_ms: i64,
    #[serde(default)]
    pub last_seen_at_ms: i64,
}

/// Redacted projection of a node for lists and events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub created_at_ms: i64,
    pub last_seen_at_ms: i64,
}

impl From<&PairedNode> for NodeView {
    fn from(n: &PairedNode) -> Self {
        Self {
            node_id: n.node_id.clone(),
            display_name: n.display_name.clone(),
            platform: n.platform.clone(),
            version: n.version.clone(),
            caps: n.caps.clone(),
            commands: n.commands.clone(),
            created_at_ms: n.created_at_ms,
            last_seen_at_ms: n.last_seen_at_ms,
        }
    }
}

/// Generate a fresh 128-bit pairing token, hex-encoded.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|e| anyhow::anyhow!("getrandom: {}", e))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}

type NodeIndex = HashMap<String, PairedNode>;

/// Persistent store for paired nodes at `<state_dir>/bridge/paired-nodes.json`.
pub struct NodeStore {
    file: JsonFile,
    inner: RwLock<NodeIndex>,
}

impl NodeStore {
    pub async fn load(state_dir: &std::path::Path) -> Self {
        let file = JsonFile::new(state_dir.join("bridge").join("paired-nodes.json"));
        let index: NodeIndex = file.read().await.ok().flatten().unwrap_or_default();
        Self {
            file,
            inner: RwLock::new(index),
        }
    }

    pub async fn get(&self, node_id: &str) -> Option<PairedNode> {
        self.inner.read().await.get(node_id).cloned()
    }

    pub async fn list(&self) -> Vec<NodeView> {
        let g = self.inner.read().await;
        let mut views: Vec<NodeView> = g.values().map(NodeView::from).collect();
        views.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        views
    }

    /// Insert or replace a pairing record and persist.
    pub async fn upsert(&self, node: PairedNode) -> Result<()> {
        let mut g = self.inner.write().await;
        g.insert(node.node_id.clone(), node);
        self.file.write(&*g).await
    }

    /// Remove a node (operator-initiated). Returns true when it existed.
    pub async fn remove(&self, node_id: &str) -> Result<bool> {
        let mut g = self.inner.write().await;
        let existed = g.remove(node_id).is_some();
        if existed {
            self.file.write(&*g).await?;
        }
        Ok(existed)
    }

    /// Stamp liveness after a successful authenticated hello.
    pub async fn touch_last_seen(&self, node_id: &str) -> Result<()> {
        let mut g = self.inner.write().await;
        if let Some(n) = g.get_mut(node_id) {
            n.last_seen_at_ms = store::now_ms();
            self.file.write(&*g).await?;
        }
        Ok(())
    }
}
