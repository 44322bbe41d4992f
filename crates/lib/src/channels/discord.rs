//! Discord channel adapter. The Discord gateway client is an external SDK;
//! this adapter owns only the envelope contract: normalized inbound and
//! text/typing sends keyed by `guildId:channelId`.

use crate::channels::registry::{ChannelHandle, SendOptions};
use crate::envelope::{Channel, ChatType, Envelope};
use async_trait::async_trait;
use std::sync::Arc;

/// Contract the Discord client implementation must fulfill.
#[async_trait]
pub trait DiscordTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), String>;

    async fn send_typing(&self, _channel_id: &str) {}

    fn stop(&self);
}

/// Raw inbound message from the Discord client before normalization.
#[derive(Debug, Clone)]
pub struct DiscordInbound {
    pub author_id: String,
    pub guild_id: Option<String>,
    pub channel_id: String,
    pub content: String,
    pub message_id: String,
    /// User ids the message @-mentioned.
    pub mentions: Vec<String>,
}

/// Normalize a Discord message. Guild messages are channel-scoped
/// conversations; DMs are direct.
pub fn envelope_from_inbound(msg: DiscordInbound) -> Envelope {
    let (chat_type, chat_key) = match &msg.guild_id {
        Some(guild) => (
            ChatType::Channel,
            format!("{}:{}", guild, msg.channel_id),
        ),
        None => (ChatType::Direct, msg.channel_id.clone()),
    };
    let mut envelope = Envelope::text(
        Channel::Discord,
        "discord-bot",
        msg.author_id,
        chat_type,
        chat_key,
        msg.content,
    );
    envelope.message_id = msg.message_id;
    envelope.mentions = msg.mentions;
    envelope
}

/// ChannelHandle over an injected Discord transport.
pub struct DiscordChannel {
    transport: Arc<dyn DiscordTransport>,
}

impl DiscordChannel {
    pub fn new(transport: Arc<dyn DiscordTransport>) -> Self {
        Self { transport }
    }

    /// Sends address the channel id; strip the guild prefix from a chat key.
    fn channel_id_of(to: &str) -> &str {
        to.rsplit_once(':').map(|(_, c)| c).unwrap_or(to)
    }
}

#[async_trait]
impl ChannelHandle for DiscordChannel {
    fn channel(&self) -> Channel {
        Channel::Discord
    }

    fn stop(&self) {
        self.transport.stop();
    }

    fn is_linked(&self) -> bool {
        self.transport.is_connected()
    }

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        _opts: &SendOptions,
    ) -> Result<(), String> {
        self.transport
            .send_text(Self::channel_id_of(to), text)
            .await
    }

    async fn send_typing(&self, to: &str, _opts: &SendOptions) {
        self.transport.send_typing(Self::channel_id_of(to)).await;
    }
}
