//! 实时事件模型
//!
//! 所有状态变更统一表达为封闭的 [`ChatEvent`] 枚举，以 `type` 标签序列化，
//! 外层由 [`EventEnvelope`] 携带接收者相关的未读数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::conversation::ConversationView;
use super::message::MessageView;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Message {
        message: MessageView,
    },
    MessageEdited {
        message: MessageView,
    },
    ConversationCreated {
        conversation: ConversationView,
    },
    /// 侧边栏刷新：最新预览 + 未读数（由信封携带）
    ConversationUpdated {
        conversation_id: String,
        latest_message: Option<MessageView>,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    ConversationMetaUpdated {
        conversation: ConversationView,
    },
    MemberAdded {
        conversation_id: String,
        user_id: String,
        actor_id: String,
    },
    MemberRemoved {
        conversation_id: String,
        user_id: String,
        actor_id: String,
    },
    MessageRecalled {
        conversation_id: String,
        message_id: String,
        recalled_at: DateTime<Utc>,
    },
    MessagePinned {
        conversation_id: String,
        message_id: String,
        pinned_by: String,
        pinned_at: DateTime<Utc>,
    },
    MessageUnpinned {
        conversation_id: String,
        message_id: String,
        unpinned_by: String,
    },
    ReactionAdded {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    ReactionRemoved {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    MessageDeletedForUser {
        conversation_id: String,
        message_id: String,
        user_id: String,
    },
    MessagesRead {
        conversation_id: String,
        user_id: String,
        last_message_id: Option<String>,
    },
    Typing {
        conversation_id: String,
        user_id: String,
        typing: bool,
    },
}

impl ChatEvent {
    /// 事件类型名（与序列化标签一致）
    pub fn kind(&self) -> &'static str {
        match self {
            ChatEvent::Message { .. } => "message",
            ChatEvent::MessageEdited { .. } => "message_edited",
            ChatEvent::ConversationCreated { .. } => "conversation_created",
            ChatEvent::ConversationUpdated { .. } => "conversation_updated",
            ChatEvent::ConversationDeleted { .. } => "conversation_deleted",
            ChatEvent::ConversationMetaUpdated { .. } => "conversation_meta_updated",
            ChatEvent::MemberAdded { .. } => "member_added",
            ChatEvent::MemberRemoved { .. } => "member_removed",
            ChatEvent::MessageRecalled { .. } => "message_recalled",
            ChatEvent::MessagePinned { .. } => "message_pinned",
            ChatEvent::MessageUnpinned { .. } => "message_unpinned",
            ChatEvent::ReactionAdded { .. } => "reaction_added",
            ChatEvent::ReactionRemoved { .. } => "reaction_removed",
            ChatEvent::MessageDeletedForUser { .. } => "message_deleted_for_user",
            ChatEvent::MessagesRead { .. } => "messages_read",
            ChatEvent::Typing { .. } => "typing",
        }
    }

    /// 个人频道投递时是否需要附带接收者的未读数
    pub fn carries_unread_count(&self) -> bool {
        matches!(
            self,
            ChatEvent::Message { .. }
                | ChatEvent::MessageRecalled { .. }
                | ChatEvent::MessageDeletedForUser { .. }
                | ChatEvent::MessagesRead { .. }
                | ChatEvent::ConversationUpdated { .. }
        )
    }
}

/// 投递目标
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Destination {
    /// 会话主题（所有订阅者）
    ConversationTopic(String),
    /// 用户主题（跨会话的侧边栏更新）
    UserTopic(String),
    /// 用户点对点队列（DIRECT 消息的冗余投递路径）
    UserQueue(String),
}

impl Destination {
    pub fn channel_name(&self, prefix: &str) -> String {
        match self {
            Destination::ConversationTopic(id) => format!("{prefix}:conversation:{id}"),
            Destination::UserTopic(id) => format!("{prefix}:user:{id}"),
            Destination::UserQueue(id) => format!("{prefix}:queue:{id}"),
        }
    }

    /// 指标标签
    pub fn channel_kind(&self) -> &'static str {
        match self {
            Destination::ConversationTopic(_) => "conversation_topic",
            Destination::UserTopic(_) => "user_topic",
            Destination::UserQueue(_) => "user_queue",
        }
    }
}

/// 实时事件信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: ChatEvent,
    pub conversation_id: String,
    /// 个人频道投递时的接收者
    pub recipient: Option<String>,
    /// 接收者在该会话中的实时未读数
    pub unread_count: Option<u64>,
    pub emitted_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn for_topic(event: ChatEvent, conversation_id: &str) -> Self {
        Self {
            event,
            conversation_id: conversation_id.to_string(),
            recipient: None,
            unread_count: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn for_recipient(
        event: ChatEvent,
        conversation_id: &str,
        recipient: &str,
        unread_count: Option<u64>,
    ) -> Self {
        Self {
            event,
            conversation_id: conversation_id.to_string(),
            recipient: Some(recipient.to_string()),
            unread_count,
            emitted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = ChatEvent::Typing {
            conversation_id: "c1".to_string(),
            user_id: "alice".to_string(),
            typing: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "typing");
        assert_eq!(json["user_id"], "alice");
        assert_eq!(event.kind(), "typing");
        assert!(!event.carries_unread_count());
    }

    #[test]
    fn test_channel_names() {
        let prefix = "flare:chat";
        assert_eq!(
            Destination::ConversationTopic("c1".to_string()).channel_name(prefix),
            "flare:chat:conversation:c1"
        );
        assert_eq!(
            Destination::UserTopic("u1".to_string()).channel_name(prefix),
            "flare:chat:user:u1"
        );
        assert_eq!(
            Destination::UserQueue("u1".to_string()).channel_name(prefix),
            "flare:chat:queue:u1"
        );
    }
}
