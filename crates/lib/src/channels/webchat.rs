//! Built-in WebChat channel: inbound arrives through the control-plane
//! WebSocket; outbound is broadcast to connected control-plane clients as
//! pre-serialized event frames.

use crate::channels::registry::{ChannelHandle, SendOptions};
use crate::envelope::Channel;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;

pub struct WebChatChannel {
    event_tx: broadcast::Sender<String>,
}

impl WebChatChannel {
    pub fn new(event_tx: broadcast::Sender<String>) -> Self {
        Self { event_tx }
    }
}

#[async_trait]
impl ChannelHandle for WebChatChannel {
    fn channel(&self) -> Channel {
        Channel::Webchat
    }

    fn stop(&self) {}

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        _opts: &SendOptions,
    ) -> Result<(), String> {
        let frame = json!({
            "event": "chat",
            "payload": { "to": to, "text": text, "state": "final" }
        });
        let line = serde_json::to_string(&frame).map_err(|e| e.to_string())?;
        // No subscribers is fine; webchat output is best effort.
        let _ = self.event_tx.send(line);
        Ok(())
    }
}
