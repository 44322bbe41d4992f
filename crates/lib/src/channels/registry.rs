//! Channel registry: register and look up transport adapters by channel.

use crate::envelope::{Channel, MediaAttachment};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-send options (subaccount selection for multi-account providers).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub account_id: Option<String>,
}

/// Handle to a running transport adapter.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn channel(&self) -> Channel;

    /// Stop the connector loop(s).
    fn stop(&self);

    /// Whether the provider is linked and able to deliver.
    fn is_linked(&self) -> bool {
        true
    }

    /// Wall-clock millis of the last successful link/credential refresh.
    fn last_linked_at_ms(&self) -> Option<i64> {
        None
    }

    /// Send a text payload (already chunked) to a conversation.
    async fn send_message(&self, to: &str, text: &str, opts: &SendOptions)
        -> Result<(), String>;

    /// Send one media payload with optional caption. Default: unsupported.
    async fn send_media(
        &self,
        _to: &str,
        _media: &MediaAttachment,
        _caption: Option<&str>,
        _opts: &SendOptions,
    ) -> Result<(), String> {
        Err("media not supported on this channel".to_string())
    }

    /// Raise a typing indicator. Best effort; default no-op.
    async fn send_typing(&self, _to: &str, _opts: &SendOptions) {}
}

/// Registry of channels to handles. Shared across the gateway.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<Channel, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(handle.channel(), handle) {
            old.stop();
        }
    }

    pub async fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(&channel).cloned()
    }

    pub async fn channels(&self) -> Vec<Channel> {
        let g = self.inner.read().await;
        g.keys().copied().collect()
    }

    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.stop();
        }
    }
}
