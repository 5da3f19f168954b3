use chrono::{DateTime, Utc};

/// 查询用户会话列表
#[derive(Debug, Clone)]
pub struct ListConversationsQuery {
    pub user_id: String,
}

/// 查询单个会话
#[derive(Debug, Clone)]
pub struct GetConversationQuery {
    pub conversation_id: String,
    pub user_id: String,
}

/// 查找两人之间已存在的单聊会话
#[derive(Debug, Clone)]
pub struct ResolveDirectQuery {
    pub user_id: String,
    pub peer_id: String,
}

/// 游标分页拉取消息
#[derive(Debug, Clone)]
pub struct GetMessagesQuery {
    pub conversation_id: String,
    pub user_id: String,
    /// 上一页最旧一条的 `sent_at`（不包含）
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<u64>,
}

/// 跳转到消息：目标消息及其前后邻居
#[derive(Debug, Clone)]
pub struct AroundMessageQuery {
    pub conversation_id: String,
    pub user_id: String,
    pub message_id: String,
    pub before: Option<u64>,
    pub after: Option<u64>,
}

/// 两条消息之间的空洞补齐
#[derive(Debug, Clone)]
pub struct BetweenMessagesQuery {
    pub conversation_id: String,
    pub user_id: String,
    pub from_message_id: String,
    pub to_message_id: String,
}

/// 会话内关键字搜索
#[derive(Debug, Clone)]
pub struct SearchMessagesQuery {
    pub conversation_id: String,
    pub user_id: String,
    pub keyword: String,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

/// 会话级查询（未读数、置顶消息）
#[derive(Debug, Clone)]
pub struct ConversationScopedQuery {
    pub conversation_id: String,
    pub user_id: String,
}
