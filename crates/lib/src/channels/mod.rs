//! Transport adapters.
//!
//! Each channel normalizes inbound messages into [`crate::envelope::Envelope`]
//! and carries out outbound sends. The registry lets the gateway start/stop
//! connectors and route replies by channel.

pub mod discord;
mod registry;
pub mod telegram;
pub mod webchat;
pub mod whatsapp;

pub use discord::{DiscordChannel, DiscordTransport};
pub use registry::{ChannelHandle, ChannelRegistry, SendOptions};
pub use telegram::TelegramChannel;
pub use webchat::WebChatChannel;
pub use whatsapp::{WhatsAppChannel, WhatsAppTransport};
