//! Telegram channel: long-poll getUpdates and sendMessage via Bot API.
//! Supports a default bot plus named subaccounts; sends pick the account via
//! [`SendOptions::account_id`].

use crate::channels::registry::{ChannelHandle, SendOptions};
use crate::envelope::{Channel, ChatType, Envelope};
use crate::store;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const DEFAULT_ACCOUNT: &str = "default";

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    chat: TelegramChat,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    entities: Vec<TelegramEntity>,
    #[serde(default)]
    reply_to_message: Option<Box<TelegramMessage>>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    chat_type: String,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramEntity {
    #[serde(rename = "type")]
    typ: String,
    offset: usize,
    length: usize,
}

struct Account {
    token: String,
}

/// Telegram connector: one getUpdates loop per account, Envelope-normalized
/// inbound, sendMessage outbound.
pub struct TelegramChannel {
    accounts: HashMap<String, Account>,
    running: AtomicBool,
    linked_at_ms: AtomicI64,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// Build from the default token plus named subaccounts.
    pub fn new(default_token: Option<String>, named: HashMap<String, String>) -> Self {
        let mut accounts = HashMap::new();
        if let Some(token) = default_token {
            accounts.insert(DEFAULT_ACCOUNT.to_string(), Account { token });
        }
        for (name, token) in named {
            accounts.insert(name, Account { token });
        }
        let linked = !accounts.is_empty();
        Self {
            accounts,
            running: AtomicBool::new(false),
            linked_at_ms: AtomicI64::new(if linked { store::now_ms() } else { 0 }),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn token_for(&self, opts: &SendOptions) -> Result<&str, String> {
        let name = opts.account_id.as_deref().unwrap_or(DEFAULT_ACCOUNT);
        self.accounts
            .get(name)
            .map(|a| a.token.as_str())
            .ok_or_else(|| format!("telegram account not configured: {}", name))
    }

    /// Start one long-poll loop per account. Returns handles to await on shutdown.
    pub fn start_inbound(
        self: &Arc<Self>,
        inbound_tx: mpsc::Sender<Envelope>,
    ) -> Vec<JoinHandle<()>> {
        self.running.store(true, Ordering::SeqCst);
        let mut handles = Vec::new();
        for name in self.accounts.keys().cloned() {
            log::info!("telegram channel: starting getUpdates loop for {}", name);
            let me = self.clone();
            let tx = inbound_tx.clone();
            handles.push(tokio::spawn(async move {
                run_get_updates_loop(me, name, tx).await;
            }));
        }
        handles
    }

    async fn get_updates(
        &self,
        token: &str,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let url = format!(
            "{}/bot{}/getUpdates?timeout={}",
            TELEGRAM_API_BASE, token, LONG_POLL_TIMEOUT
        );
        let url = if let Some(off) = offset {
            format!("{}&offset={}", url, off)
        } else {
            url
        };
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1);
        Ok((data.result, next_offset))
    }

    async fn post_send_message(
        &self,
        token: &str,
        chat_id: &str,
        text: &str,
    ) -> Result<(), String> {
        let url = format!("{}/bot{}/sendMessage", TELEGRAM_API_BASE, token);
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("sendMessage failed: {} {}", status, body));
        }
        Ok(())
    }
}

/// Map a Telegram message to the normalized envelope.
fn envelope_from_message(account: &str, msg: &TelegramMessage) -> Option<Envelope> {
    let text = msg.text.as_ref().or(msg.caption.as_ref())?;
    let chat_type = match msg.chat.chat_type.as_str() {
        "group" | "supergroup" => ChatType::Group,
        "channel" => ChatType::Channel,
        _ => ChatType::Direct,
    };
    let from = msg
        .from
        .as_ref()
        .map(|u| u.id.to_string())
        .unwrap_or_else(|| msg.chat.id.to_string());
    let mut envelope = Envelope::text(
        Channel::Telegram,
        "telegram-bot",
        from,
        chat_type,
        msg.chat.id.to_string(),
        text.clone(),
    );
    envelope.message_id = msg.message_id.to_string();
    envelope.account_id = if account == DEFAULT_ACCOUNT {
        None
    } else {
        Some(account.to_string())
    };
    envelope.reply_to = msg
        .reply_to_message
        .as_ref()
        .map(|m| m.message_id.to_string());
    // @-mentions from entity offsets (UTF-16 offsets approximated by chars;
    // good enough for ASCII usernames).
    let chars: Vec<char> = text.chars().collect();
    for e in &msg.entities {
        if e.typ == "mention" && e.offset + e.length <= chars.len() {
            let m: String = chars[e.offset..e.offset + e.length].iter().collect();
            envelope.mentions.push(m.trim_start_matches('@').to_string());
        }
    }
    Some(envelope)
}

async fn run_get_updates_loop(
    channel: Arc<TelegramChannel>,
    account: String,
    inbound_tx: mpsc::Sender<Envelope>,
) {
    let token = match channel.accounts.get(&account) {
        Some(a) => a.token.clone(),
        None => return,
    };
    let mut offset: Option<i64> = None;
    while channel.running() {
        match channel.get_updates(&token, offset).await {
            Ok((updates, next)) => {
                offset = next;
                channel.linked_at_ms.store(store::now_ms(), Ordering::SeqCst);
                for u in updates {
                    let Some(ref msg) = u.message else { continue };
                    let Some(envelope) = envelope_from_message(&account, msg) else {
                        continue;
                    };
                    if inbound_tx.send(envelope).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped for {}", account);
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_linked(&self) -> bool {
        !self.accounts.is_empty()
    }

    fn last_linked_at_ms(&self) -> Option<i64> {
        let v = self.linked_at_ms.load(Ordering::SeqCst);
        if v > 0 {
            Some(v)
        } else {
            None
        }
    }

    async fn send_message(
        &self,
        to: &str,
        text: &str,
        opts: &SendOptions,
    ) -> Result<(), String> {
        let token = self.token_for(opts)?;
        self.post_send_message(token, to, text).await
    }

    async fn send_typing(&self, to: &str, opts: &SendOptions) {
        let Ok(token) = self.token_for(opts) else { return };
        let url = format!("{}/bot{}/sendChatAction", TELEGRAM_API_BASE, token);
        let body = serde_json::json!({ "chat_id": to, "action": "typing" });
        let _ = self.client.post(&url).json(&body).send().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(text: &str, chat_type: &str) -> TelegramMessage {
        TelegramMessage {
            message_id: 7,
            chat: TelegramChat {
                id: 99,
                chat_type: chat_type.to_string(),
            },
            from: Some(TelegramUser { id: 1234 }),
            text: Some(text.to_string()),
            caption: None,
            entities: Vec::new(),
            reply_to_message: None,
        }
    }

    #[test]
    fn message_normalizes_to_envelope() {
        let e = envelope_from_message("default", &msg("hello", "private")).unwrap();
        assert_eq!(e.channel, Channel::Telegram);
        assert_eq!(e.chat_type, ChatType::Direct);
        assert_eq!(e.from, "1234");
        assert_eq!(e.chat_key, "99");
        assert_eq!(e.body, "hello");
        assert_eq!(e.message_id, "7");
        assert_eq!(e.account_id, None);
    }

    #[test]
    fn named_account_and_mentions_carry_through() {
        let mut m = msg("@bot hello", "supergroup");
        m.entities.push(TelegramEntity {
            typ: "mention".into(),
            offset: 0,
            length: 4,
        });
        let e = envelope_from_message("work", &m).unwrap();
        assert_eq!(e.chat_type, ChatType::Group);
        assert_eq!(e.account_id.as_deref(), Some("work"));
        assert_eq!(e.mentions, vec!["bot".to_string()]);
    }

    #[test]
    fn account_selection_errors_on_unknown() {
        let ch = TelegramChannel::new(Some("T".into()), HashMap::new());
        assert!(ch.token_for(&SendOptions::default()).is_ok());
        let opts = SendOptions {
            account_id: Some("work".into()),
        };
        assert!(ch.token_for(&opts).is_err());
    }
}
