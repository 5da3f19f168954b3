pub mod conversation;
pub mod event;
pub mod message;

pub use conversation::{
    Conversation, ConversationKind, ConversationMetaUpdate, ConversationPreference,
    ConversationView, ViewerState,
};
pub use event::{ChatEvent, Destination, EventEnvelope};
pub use message::{
    EditRecord, Message, MessageKind, MessageState, MessageView, RECALLED_PLACEHOLDER,
    ReplySnapshot,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 侧边栏会话摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// 共享字段；请求者自己的标注见下方各字段
    pub conversation: ConversationView,
    pub display_name: Option<String>,
    pub latest_message: Option<MessageView>,
    pub unread_count: u64,
    pub pinned: bool,
    pub muted: bool,
    pub manually_unread: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// 游标分页结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    /// 升序（旧 -> 新）
    pub messages: Vec<MessageView>,
    /// 下一页游标：本页最旧一条的 `sent_at`
    pub next_cursor: Option<DateTime<Utc>>,
    pub has_more: bool,
}

/// 关键字搜索结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub messages: Vec<MessageView>,
    pub offset: u64,
    pub limit: u64,
    pub has_more: bool,
}
