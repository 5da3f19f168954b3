//! 分页与搜索
//!
//! 只读路径：所有结果都经过可见性解析器（历史模式）渲染。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::model::{MessagePage, MessageView, SearchResult};
use crate::domain::repository::{ConversationRepository, MessageFilter, MessageRepository};
use crate::domain::service::visibility::VisibilityResolver;
use crate::domain::service::{load_for_member, load_message_in};
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub around_before: u64,
    pub around_after: u64,
    pub search_page_size: u64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_page_size: 30,
            max_page_size: 200,
            around_before: 20,
            around_after: 20,
            search_page_size: 20,
        }
    }
}

impl QuerySettings {
    fn page_size(&self, requested: Option<u64>, fallback: u64) -> u64 {
        requested.unwrap_or(fallback).clamp(1, self.max_page_size.max(1))
    }
}

pub struct MessageQueryService {
    conversation_repo: Arc<dyn ConversationRepository>,
    message_repo: Arc<dyn MessageRepository>,
    resolver: VisibilityResolver,
    settings: QuerySettings,
}

impl MessageQueryService {
    pub fn new(
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        resolver: VisibilityResolver,
        settings: QuerySettings,
    ) -> Self {
        Self {
            conversation_repo,
            message_repo,
            resolver,
            settings,
        }
    }

    /// 游标分页向上滚动
    ///
    /// 按 `sent_at` 倒序取 `cursor` 之前（严格小于）的一页，再反转为升序返回。
    /// 游标取值而非偏移量，之后插入的新消息不会改变已返回的页。
    pub async fn get_messages_for_user(
        &self,
        conversation_id: &str,
        user_id: &str,
        cursor: Option<DateTime<Utc>>,
        limit: Option<u64>,
    ) -> Result<MessagePage> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        let limit = self
            .settings
            .page_size(limit, self.settings.default_page_size);

        let mut filter = MessageFilter::conversation(conversation_id)
            .visible_to(user_id)
            .newest_first()
            .take(limit + 1);
        if let Some(cursor) = cursor {
            filter = filter.before(cursor);
        }

        let mut messages = self.message_repo.query(&filter).await?;
        let has_more = messages.len() as u64 > limit;
        messages.truncate(limit as usize);
        messages.reverse();

        let next_cursor = messages.first().map(|m| m.sent_at);
        debug!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            returned = messages.len(),
            has_more = has_more,
            "Message page loaded"
        );

        Ok(MessagePage {
            messages: self.resolver.history(&messages, user_id),
            next_cursor,
            has_more,
        })
    }

    /// 跳转到消息：目标之前至多 `before` 条、目标本身、目标之后至多 `after` 条（均不含撤回）
    pub async fn around_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
        before: Option<u64>,
        after: Option<u64>,
    ) -> Result<Vec<MessageView>> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        let target = load_message_in(self.message_repo.as_ref(), conversation_id, message_id).await?;

        let before = self.settings.page_size(before, self.settings.around_before);
        let after = self.settings.page_size(after, self.settings.around_after);
        let base = MessageFilter::conversation(conversation_id)
            .visible_to(user_id)
            .without_recalled();

        let mut older = self
            .message_repo
            .query(&base.clone().before(target.sent_at).newest_first().take(before))
            .await?;
        older.reverse();
        let newer = self
            .message_repo
            .query(&base.after(target.sent_at).oldest_first().take(after))
            .await?;

        let mut window = older;
        window.push(target);
        window.extend(newer);
        Ok(self.resolver.history(&window, user_id))
    }

    /// 补洞：两条边界消息时间之间（开区间）的所有未撤回消息，升序
    pub async fn between(
        &self,
        conversation_id: &str,
        user_id: &str,
        from_message_id: &str,
        to_message_id: &str,
    ) -> Result<Vec<MessageView>> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        let from = load_message_in(self.message_repo.as_ref(), conversation_id, from_message_id).await?;
        let to = load_message_in(self.message_repo.as_ref(), conversation_id, to_message_id).await?;

        let (lower, upper) = if from.sent_at <= to.sent_at {
            (from.sent_at, to.sent_at)
        } else {
            (to.sent_at, from.sent_at)
        };

        let messages = self
            .message_repo
            .query(
                &MessageFilter::conversation(conversation_id)
                    .visible_to(user_id)
                    .without_recalled()
                    .after(lower)
                    .before(upper)
                    .oldest_first(),
            )
            .await?;
        Ok(self.resolver.history(&messages, user_id))
    }

    /// 会话内关键字搜索（大小写不敏感，不含撤回与对自己删除的消息），偏移分页
    pub async fn search(
        &self,
        conversation_id: &str,
        user_id: &str,
        keyword: &str,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<SearchResult> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(ChatError::invalid_argument("keyword is required"));
        }
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;

        let offset = offset.unwrap_or(0);
        let limit = self.settings.page_size(limit, self.settings.search_page_size);

        let mut messages = self
            .message_repo
            .query(
                &MessageFilter::conversation(conversation_id)
                    .visible_to(user_id)
                    .without_recalled()
                    .containing(keyword)
                    .newest_first()
                    .skip(offset)
                    .take(limit + 1),
            )
            .await?;
        let has_more = messages.len() as u64 > limit;
        messages.truncate(limit as usize);

        Ok(SearchResult {
            messages: self.resolver.history(&messages, user_id),
            offset,
            limit,
            has_more,
        })
    }
}
