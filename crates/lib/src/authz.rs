//! Authorization and activation: allowlists, group mention gating, and the
//! decision whether an inbound envelope may reach the scheduler at all.

use crate::config::{AdminConfig, ChannelConfig};
use crate::envelope::{ChatType, Envelope};
use crate::session::{Activation, Session};

/// Result of the authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Rejected; the envelope never reaches the scheduler.
    Deny,
    /// Accepted. `mention_only` marks a group turn allowed solely because the
    /// bot was mentioned (the group itself is not allowlisted).
    Allow { mention_only: bool },
}

/// `*` matches any sender; otherwise exact match after trimming.
pub fn allowlist_matches(allow_from: &[String], from: &str) -> bool {
    let from = from.trim();
    allow_from
        .iter()
        .any(|a| a.trim() == "*" || a.trim() == from)
}

/// Whether any of the bot's identifiers is mentioned, in the explicit mention
/// set, the body, or a media caption.
pub fn is_mentioned(envelope: &Envelope, bot_ids: &[String]) -> bool {
    let id_hit = |text: &str| {
        bot_ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .any(|id| text.contains(&format!("@{}", id.trim())))
    };
    if envelope
        .mentions
        .iter()
        .any(|m| bot_ids.iter().any(|id| id.trim() == m.trim()))
    {
        return true;
    }
    if id_hit(&envelope.body) {
        return true;
    }
    envelope
        .media
        .iter()
        .filter_map(|m| m.caption.as_deref())
        .any(id_hit)
}

/// Authorize one envelope against channel config and session state.
///
/// Direct chats: the per-channel allowlist decides. Groups: the sender (or
/// `*`) must be allowlisted AND activation must fire — the bot is mentioned,
/// activation is `always`, or the group's `requireMention` is false. A
/// mention also lets a non-allowlisted group through for that single turn.
pub fn authorize(
    envelope: &Envelope,
    channel_cfg: &ChannelConfig,
    session: &Session,
    bot_ids: &[String],
) -> Decision {
    match envelope.chat_type {
        ChatType::Direct => {
            if allowlist_matches(&channel_cfg.allow_from, &envelope.from) {
                Decision::Allow {
                    mention_only: false,
                }
            } else {
                Decision::Deny
            }
        }
        ChatType::Group | ChatType::Channel => {
            let mentioned = is_mentioned(envelope, bot_ids);
            let group_cfg = channel_cfg.groups.get(&envelope.chat_key);
            let require_mention = group_cfg
                .and_then(|g| g.require_mention)
                .unwrap_or(true);
            let activation = session
                .activation
                .or_else(|| group_cfg.and_then(|g| g.activation))
                .unwrap_or(Activation::Mention);

            let allowlisted = allowlist_matches(&channel_cfg.allow_from, &envelope.from);
            let activated =
                mentioned || activation == Activation::Always || !require_mention;

            if allowlisted && activated {
                Decision::Allow {
                    mention_only: false,
                }
            } else if mentioned {
                // Not allowlisted, but directly addressed: reply this turn only.
                Decision::Allow { mention_only: true }
            } else {
                Decision::Deny
            }
        }
    }
}

/// Whether a sender may issue privileged directives (/restart).
pub fn is_admin(admin: &AdminConfig, from: &str) -> bool {
    allowlist_matches(&admin.allow_from, from)
}
