//! Canned chat provider with gateway-style history paging.

use crate::models::{ChatKind, ChatMeta, Message, MessageContent, MessageSender, UserMeta};
use crate::provider::{ChatProvider, ProviderError};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Script {
    chat_order: Vec<i64>,
    chats: HashMap<i64, ChatMeta>,
    users: HashMap<i64, UserMeta>,
    /// Per chat, keyed by message id.
    history: HashMap<i64, BTreeMap<i64, Message>>,
    failing_chats: HashSet<i64>,
    list_fails: bool,
    latency: Option<Duration>,
    history_calls: Vec<HistoryCall>,
}

/// Arguments of one `get_chat_history` call, as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryCall {
    pub chat_id: i64,
    pub from_message_id: i64,
    pub offset: i32,
    pub limit: usize,
}

/// Clones share one script.
#[derive(Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chat(&self, chat: ChatMeta) {
        let mut script = self.script.lock();
        if !script.chats.contains_key(&chat.id) {
            script.chat_order.push(chat.id);
        }
        script.chats.insert(chat.id, chat);
    }

    pub fn add_user(&self, user: UserMeta) {
        self.script.lock().users.insert(user.id, user);
    }

    pub fn add_message(&self, message: Message) {
        self.script
            .lock()
            .history
            .entry(message.chat_id)
            .or_default()
            .insert(message.id, message);
    }

    /// `get_chat` for this chat fails from now on.
    pub fn fail_chat(&self, chat_id: i64) {
        self.script.lock().failing_chats.insert(chat_id);
    }

    pub fn fail_list(&self, fail: bool) {
        self.script.lock().list_fails = fail;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().latency = Some(latency);
    }

    pub fn history_calls(&self) -> Vec<HistoryCall> {
        self.script.lock().history_calls.clone()
    }

    async fn delay(&self) {
        let latency = self.script.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl ChatProvider for ScriptedProvider {
    async fn list_chats(&self, limit: usize) -> Result<Vec<i64>, ProviderError> {
        self.delay().await;
        let script = self.script.lock();
        if script.list_fails {
            return Err(ProviderError::Backend("chat list unavailable".to_string()));
        }
        Ok(script.chat_order.iter().copied().take(limit).collect())
    }

    async fn get_chat(&self, chat_id: i64) -> Result<ChatMeta, ProviderError> {
        self.delay().await;
        let script = self.script.lock();
        if script.failing_chats.contains(&chat_id) {
            return Err(ProviderError::Backend(format!("chat {chat_id} unavailable")));
        }
        script
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("chat {chat_id}")))
    }

    /// Newest first. `from_message_id` itself is included when present; a
    /// negative `offset` moves the window towards newer messages.
    async fn get_chat_history(
        &self,
        chat_id: i64,
        from_message_id: i64,
        offset: i32,
        limit: usize,
    ) -> Result<Vec<Message>, ProviderError> {
        self.delay().await;
        let mut script = self.script.lock();
        script.history_calls.push(HistoryCall {
            chat_id,
            from_message_id,
            offset,
            limit,
        });

        let Some(messages) = script.history.get(&chat_id) else {
            return Ok(Vec::new());
        };

        let newest_first: Vec<&Message> = messages.values().rev().collect();
        let anchor = if from_message_id == 0 {
            0
        } else {
            newest_first
                .iter()
                .position(|message| message.id <= from_message_id)
                .unwrap_or(newest_first.len())
        };
        let newer = if offset < 0 {
            offset.unsigned_abs() as usize
        } else {
            0
        };
        let start = anchor.saturating_sub(newer);

        Ok(newest_first
            .into_iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_user(&self, user_id: i64) -> Result<UserMeta, ProviderError> {
        self.delay().await;
        self.script
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("user {user_id}")))
    }
}

pub fn group(id: i64) -> ChatMeta {
    ChatMeta {
        id,
        title: format!("group {id}"),
        kind: ChatKind::Supergroup,
    }
}

pub fn user(id: i64) -> UserMeta {
    UserMeta {
        id,
        username: Some(format!("user{id}")),
        first_name: Some("Test".to_string()),
        last_name: None,
        phone: None,
        flags: Default::default(),
        kind: Default::default(),
    }
}

/// A plain text message sent by `user_id`, timestamped from its id.
pub fn text_message(chat_id: i64, id: i64, user_id: i64, text: &str) -> Message {
    Message {
        id,
        chat_id,
        sender: MessageSender::User { user_id },
        sent_at: Utc
            .timestamp_opt(1_700_000_000 + id, 0)
            .single()
            .unwrap_or_default(),
        edited_at: None,
        reply_to_id: None,
        forward_info: None,
        content: MessageContent::Text {
            text: text.to_string(),
            entities: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with(ids: &[i64]) -> ScriptedProvider {
        let provider = ScriptedProvider::new();
        for &id in ids {
            provider.add_message(text_message(1, id, 9, "m"));
        }
        provider
    }

    async fn ids(provider: &ScriptedProvider, from: i64, offset: i32, limit: usize) -> Vec<i64> {
        provider
            .get_chat_history(1, from, offset, limit)
            .await
            .expect("history")
            .into_iter()
            .map(|message| message.id)
            .collect()
    }

    #[tokio::test]
    async fn test_latest_first_from_zero() {
        let provider = provider_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ids(&provider, 0, 0, 3).await, vec![5, 4, 3]);
    }

    #[tokio::test]
    async fn test_from_id_pages_older() {
        let provider = provider_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ids(&provider, 3, 0, 10).await, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_negative_offset_includes_newer() {
        let provider = provider_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ids(&provider, 3, -2, 3).await, vec![5, 4, 3]);
        assert_eq!(ids(&provider, 3, -1, 10).await, vec![4, 3, 2, 1]);
    }
}
