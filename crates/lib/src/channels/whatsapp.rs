//! WhatsApp channel adapter. The WhatsApp Web socket itself is an external
//! SDK; the gateway depends only on this send/receive envelope contract and
//! link-state probes.

use crate::channels::registry::{ChannelHandle, SendOptions};
use crate::envelope::{Channel, ChatType, Envelope, MediaAttachment};
use async_trait::async_trait;
use std::sync::Arc;

/// Contract the WhatsApp Web implementation must fulfill.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    /// Stored web credentials exist on disk.
    fn web_auth_exists(&self) -> bool;

    /// The web socket listener is currently up.
    fn has_active_web_listener(&self) -> bool;

    /// Wall-clock millis of the last credential refresh.
    fn last_creds_refresh_ms(&self) -> Option<i64> {
        None
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<(), String>;

    async fn send_media(
        &self,
        _to: &str,
        _media: &MediaAttachment,
        _caption: Option<&str>,
    ) -> Result<(), String> {
        Err("media send not supported".to_string())
    }

    async fn send_typing(&self, _to: &str) {}

    fn stop(&self);
}

/// Raw inbound message produced by the WhatsApp SDK before normalization.
#[derive(Debug, Clone)]
pub struct WhatsAppInbound {
    pub from_jid: String,
    pub chat_jid: String,
    pub is_group: bool,
    pub body: String,
    pub message_id: String,
    pub mentions: Vec<String>,
    pub media: Vec<MediaAttachment>,
}

/// Normalize an SDK message into the gateway envelope.
pub fn envelope_from_inbound(msg: WhatsAppInbound) -> Envelope {
    let chat_type = if msg.is_group {
        ChatType::Group
    } else {
        ChatType::Direct
    };
    let mut envelope = Envelope::text(
        Channel::Whatsapp,
        "whatsapp-web",
        msg.from_jid,
        chat_type,
        msg.chat_jid,
        msg.body,
    );
    envelope.message_id = msg.message_id;
    envelope.mentions = msg.mentions;
    envelope.media = msg.media;
    envelope
}

/// ChannelHandle over an injected WhatsApp transport.
pub struct WhatsAppChannel {
    transport: Arc<dyn WhatsAppTransport>,
}

impl WhatsAppChannel {
    pub fn new(transport: Arc<dyn WhatsAppTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ChannelHandle for WhatsAppChannel {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn stop(&self) {
        self.transport.stop();
    }

    fn is_linked(&self) -> bool {
        self.transport.web_auth_exists() && self.transport.has_active_web_listener()
    }

    fn last_linked_at_ms(&self) -> Option<i64> {
        self.transport.last_creds_refresh_ms()
    }

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        _opts: &SendOptions,
    ) -> Result<(), String> {
        if !self.is_linked() {
            return Err("whatsapp not linked".to_string());
        }
        self.transport.send_text(to, text).await
    }

    async fn send_media(
        &self,
        to: &str,
        media: &MediaAttachment,
        caption: Option<&str>,
        _opts: &SendOptions,
    ) -> Result<(), String> {
        if !self.is_linked() {
            return Err("whatsapp not linked".to_string());
        }
        self.transport.send_media(to, media, caption).await
    }

    async fn send_typing(&self, to: &str, _opts: &SendOptions) {
        self.transport.send_typing(to).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_normalizes_group_and_direct() {
        let e = envelope_from_inbound(WhatsAppInbound {
            from_jid: "+491701@s.whatsapp.net".into(),
            chat_jid: "group-7@g.us".into(),
            is_group: true,
            body: "> quoted\n@bot hi".into(),
            message_id: "wa-1".into(),
            mentions: vec!["bot".into()],
            media: Vec::new(),
        });
        assert_eq!(e.chat_type, ChatType::Group);
        assert_eq!(e.body, "@bot hi");
        assert_eq!(e.raw_body, "> quoted\n@bot hi");
        assert_eq!(e.mentions, vec!["bot".to_string()]);
    }
}
