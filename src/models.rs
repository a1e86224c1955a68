use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ===== Chat Models =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Secret,
    BasicGroup,
    Supergroup,
    Channel,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Secret => "secret",
            ChatKind::BasicGroup => "basic_group",
            ChatKind::Supergroup => "supergroup",
            ChatKind::Channel => "channel",
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, ChatKind::BasicGroup | ChatKind::Supergroup)
    }

    pub fn is_private(&self) -> bool {
        matches!(self, ChatKind::Private | ChatKind::Secret)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMeta {
    pub id: i64,
    pub title: String,
    pub kind: ChatKind,
}

// ===== User Models =====

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    #[default]
    Regular,
    Bot,
    Deleted,
    Unknown,
}

impl UserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserKind::Regular => "user",
            UserKind::Bot => "bot",
            UserKind::Deleted => "deleted",
            UserKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UserFlags {
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub is_support: bool,
    #[serde(default)]
    pub is_scam: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMeta {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub flags: UserFlags,
    #[serde(default)]
    pub kind: UserKind,
}

// ===== Message Models =====

/// Who sent a message: a user, or a chat posting on its own behalf.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageSender {
    User { user_id: i64 },
    Chat { chat_id: i64 },
}

impl MessageSender {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            MessageSender::User { user_id } => Some(*user_id),
            MessageSender::Chat { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default)]
        entities: Option<serde_json::Value>,
    },
    /// Photos, stickers, polls and anything else we do not archive yet.
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ForwardOrigin {
    User { sender_user_id: i64 },
    HiddenUser { sender_name: String },
    Chat {
        sender_chat_id: i64,
        author_signature: Option<String>,
    },
    Channel {
        chat_id: i64,
        message_id: i64,
        author_signature: Option<String>,
    },
    MessageImport { sender_name: String },
}

impl ForwardOrigin {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardOrigin::User { .. } => "user",
            ForwardOrigin::HiddenUser { .. } => "hidden_user",
            ForwardOrigin::Chat { .. } => "chat",
            ForwardOrigin::Channel { .. } => "channel",
            ForwardOrigin::MessageImport { .. } => "message_import",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardInfo {
    pub origin: ForwardOrigin,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub date: DateTime<Utc>,
    pub from_chat_id: Option<i64>,
    pub from_message_id: Option<i64>,
    pub public_service_announcement_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub sender: MessageSender,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub sent_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_to_id: Option<i64>,
    pub forward_info: Option<ForwardInfo>,
    pub content: MessageContent,
}

impl Message {
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text, .. } => Some(text),
            MessageContent::Unsupported => None,
        }
    }

    /// Edit time when edited, otherwise the send time.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.sent_at)
    }
}
