//! Normalized inbound message: every transport adapter produces an Envelope,
//! and everything downstream (authorization, activation, scheduling) consumes
//! only this shape.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Logical transport a message arrived on or should leave through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Whatsapp,
    Telegram,
    Discord,
    Webchat,
    Node,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "whatsapp",
            Channel::Telegram => "telegram",
            Channel::Discord => "discord",
            Channel::Webchat => "webchat",
            Channel::Node => "node",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s.trim().to_lowercase().as_str() {
            "whatsapp" => Some(Channel::Whatsapp),
            "telegram" => Some(Channel::Telegram),
            "discord" => Some(Channel::Discord),
            "webchat" => Some(Channel::Webchat),
            "node" => Some(Channel::Node),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
    Channel,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Direct => "direct",
            ChatType::Group => "group",
            ChatType::Channel => "channel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

/// One media payload attached to an inbound or outbound message. Either raw
/// bytes or a fetchable URL is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
    pub mime: String,
    pub size_bytes: u64,
    /// Caption text, scanned for mentions alongside the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Normalized inbound message, regardless of transport.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel: Channel,
    /// Physical subprovider label, e.g. "whatsapp-web", "discord-bot".
    pub provider: String,
    /// Opaque sender identifier (E.164 phone, chat id, user id).
    pub from: String,
    pub chat_type: ChatType,
    /// Transport-scoped conversation identifier (phone JID, chat id, guild+channel).
    pub chat_key: String,
    /// Optional subaccount for multi-account providers.
    pub account_id: Option<String>,
    /// Normalized text: timestamp prefixes and quote headers stripped.
    pub body: String,
    /// Original body before normalization.
    pub raw_body: String,
    pub media: Vec<MediaAttachment>,
    /// Identifiers the sender @-addressed.
    pub mentions: Vec<String>,
    pub reply_to: Option<String>,
    pub received_at: Instant,
    /// Provider-stable id, used for dedupe.
    pub message_id: String,
    /// When false, the reply is not sent to any transport (display-only
    /// node events).
    pub deliver: bool,
}

impl Envelope {
    /// Minimal constructor for text messages; adapters fill in the rest.
    pub fn text(
        channel: Channel,
        provider: impl Into<String>,
        from: impl Into<String>,
        chat_type: ChatType,
        chat_key: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let raw: String = body.into();
        Self {
            channel,
            provider: provider.into(),
            from: from.into(),
            chat_type,
            chat_key: chat_key.into(),
            account_id: None,
            body: normalize_body(&raw),
            raw_body: raw,
            media: Vec::new(),
            mentions: Vec::new(),
            reply_to: None,
            received_at: Instant::now(),
            message_id: format!("msg-{}", uuid::Uuid::new_v4()),
            deliver: true,
        }
    }
}

/// Strip transport framing from a body so directive parsing sees the text the
/// sender typed: leading `[12:34]`-style timestamp prefixes and `>`-quoted
/// header lines are removed, the rest is left intact.
pub fn normalize_body(raw: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    while let Some(first) = lines.first() {
        let t = first.trim_start();
        if t.starts_with('>') || t.is_empty() {
            lines.remove(0);
        } else {
            break;
        }
    }
    let joined = lines.join("\n");
    let trimmed = joined.trim_start();
    let stripped = if trimmed.starts_with('[') {
        match trimmed.find(']') {
            // Only treat short bracketed prefixes as timestamps.
            Some(end) if end <= 24 => trimmed[end + 1..].trim_start(),
            _ => trimmed,
        }
    } else {
        trimmed
    };
    stripped.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_quote_and_timestamp() {
        assert_eq!(normalize_body("> quoted reply\nhello"), "hello");
        assert_eq!(normalize_body("[12:34] hello"), "hello");
        assert_eq!(normalize_body("plain"), "plain");
    }

    #[test]
    fn normalize_keeps_long_bracket_text() {
        let body = "[this is not a timestamp, just brackets around a long clause] x";
        assert_eq!(normalize_body(body), body);
    }

    #[test]
    fn channel_parse_round_trips() {
        for c in [
            Channel::Whatsapp,
            Channel::Telegram,
            Channel::Discord,
            Channel::Webchat,
            Channel::Node,
        ] {
            assert_eq!(Channel::parse(c.as_str()), Some(c));
        }
        assert_eq!(Channel::parse("smoke-signal"), None);
    }
}
