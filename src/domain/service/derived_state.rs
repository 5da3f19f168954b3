//! 按需计算的派生状态：未读数与最新预览
//!
//! 不做缓存，每次从存储重新计算，避免计数漂移。

use std::sync::Arc;

use anyhow::Result;

use crate::domain::model::MessageView;
use crate::domain::repository::{MessageFilter, MessageRepository};
use crate::domain::service::visibility::VisibilityResolver;

#[derive(Clone)]
pub struct DerivedStateCalculator {
    message_repo: Arc<dyn MessageRepository>,
    resolver: VisibilityResolver,
}

impl DerivedStateCalculator {
    pub fn new(message_repo: Arc<dyn MessageRepository>, resolver: VisibilityResolver) -> Self {
        Self {
            message_repo,
            resolver,
        }
    }

    /// 未读条件：同会话、非本人发送、未撤回、未对本人删除、不在 readBy 中
    pub fn unread_filter(conversation_id: &str, user_id: &str) -> MessageFilter {
        MessageFilter::conversation(conversation_id)
            .unread_by(user_id)
            .without_recalled()
            .visible_to(user_id)
    }

    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        self.message_repo
            .count(&Self::unread_filter(conversation_id, user_id))
            .await
    }

    /// 用户视角的最新消息预览
    ///
    /// 候选按新到旧排列：最新一条未撤回消息在前，最新一条（可能已撤回）消息在后，
    /// 由解析器的 Preview 模式决定最终结果。
    pub async fn latest_preview(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Option<MessageView>> {
        let latest_visible = self
            .message_repo
            .query(
                &MessageFilter::conversation(conversation_id)
                    .visible_to(user_id)
                    .without_recalled()
                    .newest_first()
                    .take(1),
            )
            .await?;

        let mut candidates = latest_visible;
        if candidates.is_empty() {
            candidates = self
                .message_repo
                .query(
                    &MessageFilter::conversation(conversation_id)
                        .visible_to(user_id)
                        .newest_first()
                        .take(1),
                )
                .await?;
        }

        Ok(self.resolver.preview(&candidates, user_id))
    }
}
