//! 消息领域模型
//!
//! 消息生命周期：CREATED -> [EDITED]* -> [RECALLED]
//! - RECALLED 只终结展示内容，消息本身仍可被置顶、回应、对自己删除
//! - 置顶与对自己删除独立于生命周期状态

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 撤回后在历史记录与预览中展示的固定占位文本
pub const RECALLED_PLACEHOLDER: &str = "message recalled";

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Sticker,
    SystemLog,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Image => "IMAGE",
            MessageKind::File => "FILE",
            MessageKind::Sticker => "STICKER",
            MessageKind::SystemLog => "SYSTEM_LOG",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TEXT" => Some(MessageKind::Text),
            "IMAGE" => Some(MessageKind::Image),
            "FILE" => Some(MessageKind::File),
            "STICKER" => Some(MessageKind::Sticker),
            "SYSTEM_LOG" => Some(MessageKind::SystemLog),
            _ => None,
        }
    }
}

/// 消息展示生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Created,
    Edited,
    /// 终态（仅针对展示内容）
    Recalled,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Created => "CREATED",
            MessageState::Edited => "EDITED",
            MessageState::Recalled => "RECALLED",
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, MessageState::Created | MessageState::Edited)
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 回复快照（写入时捕获，之后不再回溯原消息）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySnapshot {
    pub message_id: String,
    pub content: String,
    pub sender_id: String,
}

/// 编辑历史记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    /// 编辑前的内容
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    /// 只增不减
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub reply_to: Option<ReplySnapshot>,
    /// emoji -> userIds
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    /// 只增不减，按用户不可逆
    #[serde(default)]
    pub deleted_for_users: BTreeSet<String>,
    #[serde(default)]
    pub recalled: bool,
    #[serde(default)]
    pub recalled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub pinned_by: Option<String>,
    #[serde(default)]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<EditRecord>,
}

impl Message {
    /// 创建新消息，ID 使用 ULID（按时间有序）
    pub fn compose(
        conversation_id: &str,
        sender_id: &str,
        content: impl Into<String>,
        kind: MessageKind,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.into(),
            kind,
            sent_at,
            read_by: BTreeSet::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
            deleted_for_users: BTreeSet::new(),
            recalled: false,
            recalled_at: None,
            pinned: false,
            pinned_by: None,
            pinned_at: None,
            edited: false,
            edited_at: None,
            history: Vec::new(),
        }
    }

    pub fn with_reply(mut self, snapshot: ReplySnapshot) -> Self {
        self.reply_to = Some(snapshot);
        self
    }

    pub fn state(&self) -> MessageState {
        if self.recalled {
            MessageState::Recalled
        } else if self.edited {
            MessageState::Edited
        } else {
            MessageState::Created
        }
    }

    pub fn is_deleted_for(&self, user_id: &str) -> bool {
        self.deleted_for_users.contains(user_id)
    }

    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    pub fn is_system_log(&self) -> bool {
        self.kind == MessageKind::SystemLog
    }

    /// 对 `user_id` 而言是否计入未读
    pub fn counts_as_unread_for(&self, user_id: &str) -> bool {
        self.sender_id != user_id
            && !self.recalled
            && !self.is_deleted_for(user_id)
            && !self.is_read_by(user_id)
    }

    /// 用户当前的回应（每个用户至多一个）
    pub fn reaction_of(&self, user_id: &str) -> Option<&str> {
        self.reactions
            .iter()
            .find(|(_, users)| users.contains(user_id))
            .map(|(emoji, _)| emoji.as_str())
    }

    /// 以当前内容生成回复快照；已撤回的原消息快照为占位文本
    pub fn reply_snapshot(&self) -> ReplySnapshot {
        let content = if self.recalled {
            RECALLED_PLACEHOLDER.to_string()
        } else {
            self.content.clone()
        };
        ReplySnapshot {
            message_id: self.id.clone(),
            content,
            sender_id: self.sender_id.clone(),
        }
    }
}

/// 对外展示的消息视图（经可见性解析后）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    pub recalled: bool,
    pub recalled_at: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub pinned_by: Option<String>,
    pub pinned_at: Option<DateTime<Utc>>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_to: Option<ReplySnapshot>,
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    pub read_by: BTreeSet<String>,
}

impl MessageView {
    /// 原样展示
    pub fn plain(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
            kind: message.kind,
            sent_at: message.sent_at,
            recalled: message.recalled,
            recalled_at: message.recalled_at,
            pinned: message.pinned,
            pinned_by: message.pinned_by.clone(),
            pinned_at: message.pinned_at,
            edited: message.edited,
            edited_at: message.edited_at,
            reply_to: message.reply_to.clone(),
            reactions: message.reactions.clone(),
            read_by: message.read_by.clone(),
        }
    }

    /// 撤回占位展示：内容替换为固定文本，保留在序列中的位置
    pub fn recalled_placeholder(message: &Message) -> Self {
        let mut view = Self::plain(message);
        view.content = RECALLED_PLACEHOLDER.to_string();
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message::compose("c1", "alice", "hello", MessageKind::Text, Utc::now())
    }

    #[test]
    fn test_state_transitions_follow_flags() {
        let mut message = sample();
        assert_eq!(message.state(), MessageState::Created);
        assert!(message.state().can_edit());

        message.edited = true;
        assert_eq!(message.state(), MessageState::Edited);

        message.recalled = true;
        assert_eq!(message.state(), MessageState::Recalled);
        assert!(!message.state().can_edit());
    }

    #[test]
    fn test_unread_rules() {
        let mut message = sample();
        assert!(!message.counts_as_unread_for("alice"));
        assert!(message.counts_as_unread_for("bob"));

        message.read_by.insert("bob".to_string());
        assert!(!message.counts_as_unread_for("bob"));

        assert!(message.counts_as_unread_for("carol"));
        message.deleted_for_users.insert("carol".to_string());
        assert!(!message.counts_as_unread_for("carol"));

        assert!(message.counts_as_unread_for("dave"));
        message.recalled = true;
        assert!(!message.counts_as_unread_for("dave"));
    }

    #[test]
    fn test_reply_snapshot_of_recalled_message_uses_placeholder() {
        let mut message = sample();
        assert_eq!(message.reply_snapshot().content, "hello");
        message.recalled = true;
        assert_eq!(message.reply_snapshot().content, RECALLED_PLACEHOLDER);
    }

    #[test]
    fn test_reaction_of() {
        let mut message = sample();
        assert_eq!(message.reaction_of("bob"), None);
        message
            .reactions
            .entry("👍".to_string())
            .or_default()
            .insert("bob".to_string());
        assert_eq!(message.reaction_of("bob"), Some("👍"));
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = sample();
        let b = sample();
        assert_ne!(a.id, b.id);
    }
}
