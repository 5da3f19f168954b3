//! 已读追踪 / 未读计数
//!
//! - 已读是消息上的 `readBy` 集合，只增不减
//! - `lastReadMessageId` 仅是 UI 定位指针，从不参与未读计算
//! - 任意真实的已读行为都会清除用户的“手动未读”标记

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::domain::model::{ChatEvent, ConversationPreference};
use crate::domain::repository::{ConversationRepository, MessageRepository};
use crate::domain::service::derived_state::DerivedStateCalculator;
use crate::domain::service::fanout::FanoutService;
use crate::domain::service::{field_key, load_for_member, load_message_in};
use crate::error::Result;

pub struct ReadTrackingService {
    conversation_repo: Arc<dyn ConversationRepository>,
    message_repo: Arc<dyn MessageRepository>,
    derived: DerivedStateCalculator,
    fanout: Arc<FanoutService>,
}

impl ReadTrackingService {
    pub fn new(
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        derived: DerivedStateCalculator,
        fanout: Arc<FanoutService>,
    ) -> Self {
        Self {
            conversation_repo,
            message_repo,
            derived,
            fanout,
        }
    }

    /// 将会话内所有非本人发送的消息标记为已读，返回新增已读的条数
    #[instrument(skip(self))]
    pub async fn mark_as_read(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        self.mark_read_internal(conversation_id, user_id, None).await
    }

    /// 同 [`Self::mark_as_read`]，并记录 UI 定位指针
    #[instrument(skip(self))]
    pub async fn mark_as_read_with_last_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        last_message_id: &str,
    ) -> Result<u64> {
        self.mark_read_internal(conversation_id, user_id, Some(last_message_id))
            .await
    }

    /// 实时计算的未读数
    pub async fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        Ok(self.derived.unread_count(conversation_id, user_id).await?)
    }

    async fn mark_read_internal(
        &self,
        conversation_id: &str,
        user_id: &str,
        last_message_id: Option<&str>,
    ) -> Result<u64> {
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;

        if let Some(message_id) = last_message_id {
            field_key(user_id, "user_id")?;
            load_message_in(self.message_repo.as_ref(), conversation_id, message_id).await?;
        }

        let updated = self
            .message_repo
            .mark_read_by(conversation_id, user_id)
            .await?;

        if let Some(message_id) = last_message_id {
            self.conversation_repo
                .set_last_read(conversation_id, user_id, message_id)
                .await?;
        }

        let was_manually_unread = conversation.is_manually_unread(user_id);
        if was_manually_unread {
            self.conversation_repo
                .set_preference(
                    conversation_id,
                    user_id,
                    ConversationPreference::ManuallyUnread,
                    false,
                )
                .await?;
        }

        info!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            updated = updated,
            "Conversation marked as read"
        );

        if updated > 0 || was_manually_unread || last_message_id.is_some() {
            let event = ChatEvent::MessagesRead {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                last_message_id: last_message_id.map(str::to_string),
            };
            self.fanout.publish_topic(event.clone(), conversation_id).await;
            self.fanout.notify_user(event, conversation_id, user_id).await;
        } else {
            debug!(
                conversation_id = %conversation_id,
                user_id = %user_id,
                "Nothing to mark as read, skipping broadcast"
            );
        }

        Ok(updated)
    }
}
