//! 仓储与外部协作者接口
//!
//! 存储层只暴露字段级的原子变更原语（单文档原子更新），
//! 跨文档一致性（置顶索引）由领域服务负责维护。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::model::{
    Conversation, ConversationMetaUpdate, ConversationPreference, Destination, EditRecord,
    EventEnvelope, Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// 消息查询条件
///
/// 所有时间边界均为开区间；排序键为 `(sent_at, id)`。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub conversation_id: String,
    pub sent_before: Option<DateTime<Utc>>,
    pub sent_after: Option<DateTime<Utc>>,
    pub exclude_recalled: bool,
    /// 排除已对该用户删除的消息
    pub hidden_for: Option<String>,
    /// 仅匹配该用户的未读消息（非本人发送且不在 readBy 中）
    pub unread_by: Option<String>,
    pub pinned_only: bool,
    /// 大小写不敏感的子串匹配
    pub content_contains: Option<String>,
    pub order: SortOrder,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl MessageFilter {
    pub fn conversation(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            ..Self::default()
        }
    }

    pub fn before(mut self, cursor: DateTime<Utc>) -> Self {
        self.sent_before = Some(cursor);
        self
    }

    pub fn after(mut self, cursor: DateTime<Utc>) -> Self {
        self.sent_after = Some(cursor);
        self
    }

    pub fn without_recalled(mut self) -> Self {
        self.exclude_recalled = true;
        self
    }

    pub fn visible_to(mut self, user_id: &str) -> Self {
        self.hidden_for = Some(user_id.to_string());
        self
    }

    pub fn unread_by(mut self, user_id: &str) -> Self {
        self.unread_by = Some(user_id.to_string());
        self
    }

    pub fn pinned(mut self) -> Self {
        self.pinned_only = true;
        self
    }

    pub fn containing(mut self, keyword: &str) -> Self {
        self.content_contains = Some(keyword.to_string());
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = SortOrder::Ascending;
        self
    }

    pub fn skip(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn take(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// 内存判定，与存储端查询语义保持一致
    pub fn matches(&self, message: &Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        if let Some(before) = self.sent_before {
            if message.sent_at >= before {
                return false;
            }
        }
        if let Some(after) = self.sent_after {
            if message.sent_at <= after {
                return false;
            }
        }
        if self.exclude_recalled && message.recalled {
            return false;
        }
        if let Some(user_id) = &self.hidden_for {
            if message.is_deleted_for(user_id) {
                return false;
            }
        }
        if let Some(user_id) = &self.unread_by {
            if message.sender_id == *user_id || message.is_read_by(user_id) {
                return false;
            }
        }
        if self.pinned_only && !message.pinned {
            return false;
        }
        if let Some(keyword) = &self.content_contains {
            if !message
                .content
                .to_lowercase()
                .contains(&keyword.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// 置顶标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMark {
    pub pinned_by: String,
    pub pinned_at: DateTime<Utc>,
}

/// 会话仓储接口（作为 trait 对象使用）
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn insert(&self, conversation: &Conversation) -> Result<()>;

    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    /// 查找成员集合恰为 {a, b} 的 DIRECT 会话
    async fn find_direct(&self, user_a: &str, user_b: &str) -> Result<Option<Conversation>>;

    /// 原子地插入 DIRECT 会话；若该成员对已存在会话，返回已存在的会话
    async fn insert_direct_if_absent(&self, conversation: &Conversation) -> Result<Conversation>;

    async fn list_for_member(&self, user_id: &str) -> Result<Vec<Conversation>>;

    /// 返回是否发生变更
    async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<bool>;

    async fn remove_member(&self, conversation_id: &str, user_id: &str) -> Result<bool>;

    async fn add_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    async fn remove_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()>;

    /// 用消息侧的真实置顶集合重建索引
    async fn replace_pinned_messages(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<()>;

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<()>;

    async fn set_preference(
        &self,
        conversation_id: &str,
        user_id: &str,
        preference: ConversationPreference,
        enabled: bool,
    ) -> Result<()>;

    async fn update_meta(
        &self,
        conversation_id: &str,
        update: &ConversationMetaUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn touch(&self, conversation_id: &str, updated_at: DateTime<Utc>) -> Result<()>;

    async fn delete(&self, conversation_id: &str) -> Result<bool>;
}

/// 消息仓储接口（作为 trait 对象使用）
#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<()>;

    async fn find_by_id(&self, message_id: &str) -> Result<Option<Message>>;

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>>;

    /// 计数（忽略 offset / limit / order）
    async fn count(&self, filter: &MessageFilter) -> Result<u64>;

    /// 批量将 user 加入会话内所有非本人发送消息的 readBy，返回变更条数
    async fn mark_read_by(&self, conversation_id: &str, user_id: &str) -> Result<u64>;

    async fn add_deleted_for_user(&self, message_id: &str, user_id: &str) -> Result<bool>;

    /// 仅在未撤回时生效
    async fn mark_recalled(&self, message_id: &str, recalled_at: DateTime<Utc>) -> Result<bool>;

    /// `None` 表示取消置顶
    async fn set_pin(&self, message_id: &str, pin: Option<PinMark>) -> Result<bool>;

    async fn add_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<bool>;

    async fn remove_reaction(&self, message_id: &str, emoji: &str, user_id: &str)
    -> Result<bool>;

    /// 仅在未撤回时生效；`previous` 追加到编辑历史
    async fn apply_edit(
        &self,
        message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
        previous: EditRecord,
    ) -> Result<bool>;

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64>;
}

/// 实时投递接口
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, destination: &Destination, envelope: &EventEnvelope) -> Result<()>;
}

/// Outbox 记录：一次 (目标, 事件) 投递
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub destination: Destination,
    pub envelope: EventEnvelope,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// 租约到期前记录归当前投递者所有，其他投递者跳过
    #[serde(default)]
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(destination: Destination, envelope: EventEnvelope) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination,
            envelope,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
            delivered_at: None,
            claimed_until: None,
        }
    }

    /// 入队时即持有租约（即时投递）
    pub fn claimed(destination: Destination, envelope: EventEnvelope, until: DateTime<Utc>) -> Self {
        Self {
            claimed_until: Some(until),
            ..Self::new(destination, envelope)
        }
    }

    pub fn is_claimed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.claimed_until, Some(until) if until > now)
    }
}

/// Outbox 仓储接口
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn enqueue(&self, records: &[OutboxRecord]) -> Result<()>;

    /// 认领未投递、尝试次数小于 `max_attempts` 且无有效租约的记录，按创建时间升序
    ///
    /// 被认领的记录租约延至 `lease_until`，期间不会再被认领。
    async fn claim(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>>;

    async fn mark_delivered(&self, record_id: Uuid, delivered_at: DateTime<Utc>) -> Result<()>;

    /// 计一次失败并释放租约
    async fn mark_failed(&self, record_id: Uuid, error: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<u64>;

    /// 清理早于 `before` 的已投递记录，以及创建早于 `before` 且已耗尽重试次数的记录
    async fn purge(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64>;
}

/// 用户目录（外部协作者）：解析展示名
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>>;
}
