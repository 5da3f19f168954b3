//! 消息管道服务
//!
//! 所有消息级变更的入口：发送、回复、编辑、撤回、对自己删除、置顶、回应、输入状态。
//! 每个操作遵循同一顺序：校验 -> 持久化 -> 扇出。扇出失败不会回滚持久化结果。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::domain::model::{ChatEvent, EditRecord, Message, MessageKind, MessageView};
use crate::domain::repository::{
    ConversationRepository, MessageFilter, MessageRepository, PinMark,
};
use crate::domain::service::delivery::MessageDelivery;
use crate::domain::service::derived_state::DerivedStateCalculator;
use crate::domain::service::directory::ConversationDirectoryService;
use crate::domain::service::fanout::FanoutService;
use crate::domain::service::visibility::{VisibilityMode, VisibilityResolver};
use crate::domain::service::{
    field_key, load_conversation, load_for_member, load_message, load_message_in, non_empty,
};
use crate::error::{ChatError, Result};

/// 发送参数
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    /// 缺省为服务端当前时间
    pub sent_at: Option<DateTime<Utc>>,
    pub reply_to: Option<String>,
}

impl OutgoingMessage {
    pub fn text(conversation_id: &str, sender_id: &str, content: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.into(),
            kind: MessageKind::Text,
            sent_at: None,
            reply_to: None,
        }
    }
}

pub struct MessagePipelineService {
    conversation_repo: Arc<dyn ConversationRepository>,
    message_repo: Arc<dyn MessageRepository>,
    directory: Arc<ConversationDirectoryService>,
    delivery: Arc<MessageDelivery>,
    fanout: Arc<FanoutService>,
    derived: DerivedStateCalculator,
    resolver: VisibilityResolver,
}

impl MessagePipelineService {
    pub fn new(
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        directory: Arc<ConversationDirectoryService>,
        delivery: Arc<MessageDelivery>,
        fanout: Arc<FanoutService>,
        derived: DerivedStateCalculator,
        resolver: VisibilityResolver,
    ) -> Self {
        Self {
            conversation_repo,
            message_repo,
            directory,
            delivery,
            fanout,
            derived,
            resolver,
        }
    }

    /// 发送消息（发送者须为成员）
    #[instrument(skip(self, outgoing), fields(conversation_id = %outgoing.conversation_id, sender_id = %outgoing.sender_id))]
    pub async fn send(&self, outgoing: OutgoingMessage) -> Result<Message> {
        non_empty(&outgoing.content, "content")?;
        if outgoing.kind == MessageKind::SystemLog {
            return Err(ChatError::invalid_argument(
                "system log messages cannot be sent by clients",
            ));
        }

        let conversation = load_for_member(
            self.conversation_repo.as_ref(),
            &outgoing.conversation_id,
            &outgoing.sender_id,
        )
        .await?;

        let mut message = Message::compose(
            &conversation.id,
            &outgoing.sender_id,
            outgoing.content,
            outgoing.kind,
            outgoing.sent_at.unwrap_or_else(Utc::now),
        );

        if let Some(original_id) = &outgoing.reply_to {
            let original = load_message(self.message_repo.as_ref(), original_id).await?;
            if original.conversation_id != conversation.id {
                return Err(ChatError::invalid_argument(format!(
                    "message {original_id} belongs to another conversation"
                )));
            }
            message = message.with_reply(original.reply_snapshot());
        }

        let message = self.delivery.deliver(&conversation, message).await?;
        info!(message_id = %message.id, kind = message.kind.as_str(), "Message sent");
        Ok(message)
    }

    /// 回复：原消息在写入时被快照，之后原消息的编辑、撤回都不影响快照
    pub async fn reply(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: impl Into<String>,
        reply_to_message_id: &str,
    ) -> Result<Message> {
        let mut outgoing = OutgoingMessage::text(conversation_id, sender_id, content);
        outgoing.reply_to = Some(reply_to_message_id.to_string());
        self.send(outgoing).await
    }

    /// 按对端用户发送；DIRECT 会话不存在时惰性创建
    #[instrument(skip(self, content))]
    pub async fn send_direct(
        &self,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Message> {
        non_empty(sender_id, "sender_id")?;
        non_empty(recipient_id, "recipient_id")?;
        if sender_id == recipient_id {
            return Err(ChatError::invalid_argument(
                "cannot send a direct message to yourself",
            ));
        }

        let (conversation, created) = self.directory.ensure_direct(sender_id, recipient_id).await?;
        if created {
            self.directory.announce_created(&conversation).await;
        }

        self.send(OutgoingMessage {
            conversation_id: conversation.id,
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            kind,
            sent_at: None,
            reply_to: None,
        })
        .await
    }

    /// 编辑：仅发送者，且消息未撤回、非系统日志
    #[instrument(skip(self, content))]
    pub async fn edit(&self, message_id: &str, editor_id: &str, content: &str) -> Result<Message> {
        non_empty(content, "content")?;
        let message = load_message(self.message_repo.as_ref(), message_id).await?;

        if message.sender_id != editor_id {
            return Err(ChatError::permission_denied(format!(
                "only the sender may edit message {message_id}"
            )));
        }
        if message.is_system_log() {
            return Err(ChatError::invalid_argument("system log messages cannot be edited"));
        }
        if !message.state().can_edit() {
            return Err(ChatError::invalid_argument(format!(
                "message {message_id} is {} and cannot be edited",
                message.state()
            )));
        }
        if message.content == content {
            debug!(message_id = %message_id, "Edit does not change content");
            return Ok(message);
        }

        let conversation =
            load_for_member(self.conversation_repo.as_ref(), &message.conversation_id, editor_id)
                .await?;

        let now = Utc::now();
        let applied = self
            .message_repo
            .apply_edit(
                message_id,
                content,
                now,
                EditRecord {
                    content: message.content.clone(),
                    edited_at: now,
                },
            )
            .await?;
        if !applied {
            // 并发撤回
            return Err(ChatError::invalid_argument(format!(
                "message {message_id} can no longer be edited"
            )));
        }

        let updated = load_message(self.message_repo.as_ref(), message_id).await?;
        self.fanout
            .broadcast(
                ChatEvent::MessageEdited {
                    message: MessageView::plain(&updated),
                },
                &conversation,
            )
            .await;

        info!(message_id = %message_id, revisions = updated.history.len(), "Message edited");
        Ok(updated)
    }

    /// 撤回：仅发送者；重复撤回为空操作
    ///
    /// 先广播 `message_recalled`，再向每个成员推送其视角的会话预览。
    #[instrument(skip(self))]
    pub async fn recall(&self, message_id: &str, actor_id: &str) -> Result<Message> {
        let message = load_message(self.message_repo.as_ref(), message_id).await?;
        if message.sender_id != actor_id {
            return Err(ChatError::permission_denied(format!(
                "only the sender may recall message {message_id}"
            )));
        }
        if message.recalled {
            debug!(message_id = %message_id, "Message already recalled");
            return Ok(message);
        }

        let conversation =
            load_conversation(self.conversation_repo.as_ref(), &message.conversation_id).await?;

        let recalled_at = Utc::now();
        if !self
            .message_repo
            .mark_recalled(message_id, recalled_at)
            .await?
        {
            // 并发撤回已生效
            return load_message(self.message_repo.as_ref(), message_id).await;
        }

        self.fanout
            .broadcast(
                ChatEvent::MessageRecalled {
                    conversation_id: conversation.id.clone(),
                    message_id: message_id.to_string(),
                    recalled_at,
                },
                &conversation,
            )
            .await;

        for member in &conversation.members {
            self.push_conversation_update(&conversation.id, member).await;
        }

        info!(message_id = %message_id, conversation_id = %conversation.id, "Message recalled");
        load_message(self.message_repo.as_ref(), message_id).await
    }

    /// 对自己删除：仅影响该用户的视图，不可撤销
    #[instrument(skip(self))]
    pub async fn delete_for_me(&self, message_id: &str, user_id: &str) -> Result<()> {
        let message = load_message(self.message_repo.as_ref(), message_id).await?;
        if message.is_deleted_for(user_id) {
            debug!(message_id = %message_id, user_id = %user_id, "Message already deleted for user");
            return Ok(());
        }

        load_for_member(self.conversation_repo.as_ref(), &message.conversation_id, user_id)
            .await?;

        if !self
            .message_repo
            .add_deleted_for_user(message_id, user_id)
            .await?
        {
            return Ok(());
        }

        self.fanout
            .notify_user(
                ChatEvent::MessageDeletedForUser {
                    conversation_id: message.conversation_id.clone(),
                    message_id: message_id.to_string(),
                    user_id: user_id.to_string(),
                },
                &message.conversation_id,
                user_id,
            )
            .await;
        self.push_conversation_update(&message.conversation_id, user_id)
            .await;

        info!(message_id = %message_id, user_id = %user_id, "Message deleted for user");
        Ok(())
    }

    /// 置顶：先写消息标记（真实来源），再维护会话索引
    #[instrument(skip(self))]
    pub async fn pin(
        &self,
        conversation_id: &str,
        message_id: &str,
        actor_id: &str,
    ) -> Result<MessageView> {
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, actor_id).await?;
        let message = load_message_in(self.message_repo.as_ref(), conversation_id, message_id).await?;
        let current = self.view_for(&message, actor_id)?;
        if message.pinned {
            debug!(message_id = %message_id, "Message already pinned");
            return Ok(current);
        }

        let pinned_at = Utc::now();
        self.message_repo
            .set_pin(
                message_id,
                Some(PinMark {
                    pinned_by: actor_id.to_string(),
                    pinned_at,
                }),
            )
            .await?;

        if let Err(err) = self
            .conversation_repo
            .add_pinned_message(&conversation.id, message_id)
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "Pin index update failed, reconciling");
            self.reconcile_quietly(&conversation.id).await;
        }

        let actor_name = self.directory.display_name(actor_id).await;
        if let Err(err) = self
            .delivery
            .system_log(&conversation, actor_id, format!("{actor_name} pinned a message"))
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "Failed to write pin log");
        }

        self.fanout
            .broadcast(
                ChatEvent::MessagePinned {
                    conversation_id: conversation.id.clone(),
                    message_id: message_id.to_string(),
                    pinned_by: actor_id.to_string(),
                    pinned_at,
                },
                &conversation,
            )
            .await;

        info!(message_id = %message_id, conversation_id = %conversation.id, "Message pinned");
        self.rendered(message_id, actor_id).await
    }

    #[instrument(skip(self))]
    pub async fn unpin(
        &self,
        conversation_id: &str,
        message_id: &str,
        actor_id: &str,
    ) -> Result<MessageView> {
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, actor_id).await?;
        let message = load_message_in(self.message_repo.as_ref(), conversation_id, message_id).await?;
        let current = self.view_for(&message, actor_id)?;
        if !message.pinned {
            debug!(message_id = %message_id, "Message not pinned");
            return Ok(current);
        }

        self.message_repo.set_pin(message_id, None).await?;

        if let Err(err) = self
            .conversation_repo
            .remove_pinned_message(&conversation.id, message_id)
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "Pin index update failed, reconciling");
            self.reconcile_quietly(&conversation.id).await;
        }

        let actor_name = self.directory.display_name(actor_id).await;
        if let Err(err) = self
            .delivery
            .system_log(&conversation, actor_id, format!("{actor_name} unpinned a message"))
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "Failed to write unpin log");
        }

        self.fanout
            .broadcast(
                ChatEvent::MessageUnpinned {
                    conversation_id: conversation.id.clone(),
                    message_id: message_id.to_string(),
                    unpinned_by: actor_id.to_string(),
                },
                &conversation,
            )
            .await;

        info!(message_id = %message_id, conversation_id = %conversation.id, "Message unpinned");
        self.rendered(message_id, actor_id).await
    }

    /// 会话内的置顶消息（最近置顶在前），读取消息侧标记
    pub async fn pinned_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageView>> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        let mut pinned = self
            .message_repo
            .query(
                &MessageFilter::conversation(conversation_id)
                    .pinned()
                    .visible_to(user_id),
            )
            .await?;
        pinned.sort_by(|a, b| b.pinned_at.cmp(&a.pinned_at));
        Ok(self.resolver.history(&pinned, user_id))
    }

    /// 以消息侧置顶标记重建会话置顶索引，返回重建后的消息ID
    pub async fn reconcile_pins(&self, conversation_id: &str) -> Result<Vec<String>> {
        load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;
        let pinned = self
            .message_repo
            .query(&MessageFilter::conversation(conversation_id).pinned())
            .await?;
        let ids: Vec<String> = pinned.into_iter().map(|m| m.id).collect();
        self.conversation_repo
            .replace_pinned_messages(conversation_id, &ids)
            .await?;
        info!(conversation_id = %conversation_id, pinned = ids.len(), "Pin index reconciled");
        Ok(ids)
    }

    async fn reconcile_quietly(&self, conversation_id: &str) {
        if let Err(err) = self.reconcile_pins(conversation_id).await {
            warn!(conversation_id = %conversation_id, error = %err, "Pin index reconcile failed");
        }
    }

    /// 添加回应：每个用户每条消息至多一个回应
    ///
    /// 相同 emoji 为空操作；不同 emoji 先移除旧回应（广播 `reaction_removed`）再添加。
    #[instrument(skip(self))]
    pub async fn add_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<MessageView> {
        let emoji = emoji.trim();
        field_key(emoji, "emoji")?;

        let message = load_message(self.message_repo.as_ref(), message_id).await?;
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), &message.conversation_id, user_id)
                .await?;
        let current = self.view_for(&message, user_id)?;

        let previous = message.reaction_of(user_id).map(str::to_string);
        if previous.as_deref() == Some(emoji) {
            debug!(message_id = %message_id, user_id = %user_id, "Reaction unchanged");
            return Ok(current);
        }

        if let Some(old) = previous {
            self.message_repo
                .remove_reaction(message_id, &old, user_id)
                .await?;
            self.fanout
                .broadcast(
                    ChatEvent::ReactionRemoved {
                        conversation_id: conversation.id.clone(),
                        message_id: message_id.to_string(),
                        user_id: user_id.to_string(),
                        emoji: old,
                    },
                    &conversation,
                )
                .await;
        }

        self.message_repo
            .add_reaction(message_id, emoji, user_id)
            .await?;
        self.fanout
            .broadcast(
                ChatEvent::ReactionAdded {
                    conversation_id: conversation.id.clone(),
                    message_id: message_id.to_string(),
                    user_id: user_id.to_string(),
                    emoji: emoji.to_string(),
                },
                &conversation,
            )
            .await;

        self.rendered(message_id, user_id).await
    }

    /// 移除用户的回应；用户没有回应时为空操作
    #[instrument(skip(self))]
    pub async fn remove_reaction(&self, message_id: &str, user_id: &str) -> Result<MessageView> {
        let message = load_message(self.message_repo.as_ref(), message_id).await?;
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), &message.conversation_id, user_id)
                .await?;
        let current = self.view_for(&message, user_id)?;

        let Some(emoji) = message.reaction_of(user_id).map(str::to_string) else {
            debug!(message_id = %message_id, user_id = %user_id, "No reaction to remove");
            return Ok(current);
        };

        self.message_repo
            .remove_reaction(message_id, &emoji, user_id)
            .await?;
        self.fanout
            .broadcast(
                ChatEvent::ReactionRemoved {
                    conversation_id: conversation.id.clone(),
                    message_id: message_id.to_string(),
                    user_id: user_id.to_string(),
                    emoji,
                },
                &conversation,
            )
            .await;

        self.rendered(message_id, user_id).await
    }

    /// 输入状态：只发布到会话主题，不落库
    pub async fn typing(&self, conversation_id: &str, user_id: &str, typing: bool) -> Result<()> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        self.fanout
            .publish_topic(
                ChatEvent::Typing {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                    typing,
                },
                conversation_id,
            )
            .await;
        Ok(())
    }

    /// 按历史模式为操作者渲染消息；对其隐藏的消息视为不存在
    fn view_for(&self, message: &Message, user_id: &str) -> Result<MessageView> {
        self.resolver
            .visible(message, user_id, VisibilityMode::History)
            .into_view()
            .ok_or_else(|| ChatError::not_found(format!("message {}", message.id)))
    }

    async fn rendered(&self, message_id: &str, user_id: &str) -> Result<MessageView> {
        let message = load_message(self.message_repo.as_ref(), message_id).await?;
        self.view_for(&message, user_id)
    }

    async fn push_conversation_update(&self, conversation_id: &str, user_id: &str) {
        let latest_message = match self.derived.latest_preview(conversation_id, user_id).await {
            Ok(preview) => preview,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    user_id = %user_id,
                    error = %err,
                    "Failed to compute conversation preview"
                );
                return;
            }
        };
        self.fanout
            .notify_user(
                ChatEvent::ConversationUpdated {
                    conversation_id: conversation_id.to_string(),
                    latest_message,
                },
                conversation_id,
                user_id,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Destination, RECALLED_PLACEHOLDER};
    use crate::domain::service::test_support::TestEngine;

    #[tokio::test]
    async fn test_send_requires_membership() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let err = engine
            .pipeline
            .send(OutgoingMessage::text(&conversation.id, "mallory", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_send_direct_creates_conversation_once() {
        let engine = TestEngine::new();
        let first = engine
            .pipeline
            .send_direct("alice", "bob", "hi", MessageKind::Text)
            .await
            .unwrap();
        let second = engine
            .pipeline
            .send_direct("bob", "alice", "hey", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);

        let resolved = engine.directory.resolve_direct("bob", "alice").await.unwrap();
        assert_eq!(resolved.id, first.conversation_id);

        let queued = engine
            .publisher
            .events_for(&Destination::UserQueue("bob".to_string()));
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn test_send_direct_to_self_is_invalid() {
        let engine = TestEngine::new();
        let err = engine
            .pipeline
            .send_direct("alice", "alice", "hi", MessageKind::Text)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_reply_snapshot_is_immutable() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let original = engine.send_text(&conversation.id, "alice", "original").await;
        let reply = engine
            .pipeline
            .reply(&conversation.id, "bob", "answer", &original.id)
            .await
            .unwrap();

        engine
            .pipeline
            .edit(&original.id, "alice", "changed")
            .await
            .unwrap();
        engine.pipeline.recall(&original.id, "alice").await.unwrap();

        let stored = engine.message(&reply.id).await;
        let snapshot = stored.reply_to.unwrap();
        assert_eq!(snapshot.content, "original");
        assert_eq!(snapshot.sender_id, "alice");

        let err = engine
            .pipeline
            .reply(&conversation.id, "bob", "answer", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_edit_rules() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "v1").await;

        let err = engine
            .pipeline
            .edit(&message.id, "bob", "hacked")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let edited = engine
            .pipeline
            .edit(&message.id, "alice", "v2")
            .await
            .unwrap();
        assert!(edited.edited);
        assert_eq!(edited.content, "v2");
        assert_eq!(edited.history.len(), 1);
        assert_eq!(edited.history[0].content, "v1");

        engine.pipeline.recall(&message.id, "alice").await.unwrap();
        let err = engine
            .pipeline
            .edit(&message.id, "alice", "v3")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_recall_is_sender_only_and_idempotent() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "oops").await;

        let err = engine
            .pipeline
            .recall(&message.id, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let recalled = engine.pipeline.recall(&message.id, "alice").await.unwrap();
        assert!(recalled.recalled);
        let recalled_at = recalled.recalled_at;

        let again = engine.pipeline.recall(&message.id, "alice").await.unwrap();
        assert_eq!(again.recalled_at, recalled_at);

        let recall_events = engine
            .publisher
            .events_for(&Destination::ConversationTopic(conversation.id.clone()))
            .into_iter()
            .filter(|e| matches!(e.event, ChatEvent::MessageRecalled { .. }))
            .count();
        assert_eq!(recall_events, 1);

        // bob 的侧边栏预览跳过撤回消息，退回到系统日志
        let updates: Vec<_> = engine
            .publisher
            .events_for(&Destination::UserTopic("bob".to_string()))
            .into_iter()
            .filter_map(|e| match e.event {
                ChatEvent::ConversationUpdated { latest_message, .. } => latest_message,
                _ => None,
            })
            .collect();
        let preview = updates.last().unwrap();
        assert_ne!(preview.content, RECALLED_PLACEHOLDER);
        assert_ne!(preview.id, message.id);
    }

    #[tokio::test]
    async fn test_delete_for_me_is_idempotent_and_personal() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "secret").await;

        engine.pipeline.delete_for_me(&message.id, "bob").await.unwrap();
        engine.pipeline.delete_for_me(&message.id, "bob").await.unwrap();

        let stored = engine.message(&message.id).await;
        assert_eq!(stored.deleted_for_users.len(), 1);

        let deleted_events = engine
            .publisher
            .events_for(&Destination::UserTopic("bob".to_string()))
            .into_iter()
            .filter(|e| matches!(e.event, ChatEvent::MessageDeletedForUser { .. }))
            .count();
        assert_eq!(deleted_events, 1);
        assert!(
            engine
                .publisher
                .events_for(&Destination::UserTopic("alice".to_string()))
                .iter()
                .all(|e| !matches!(e.event, ChatEvent::MessageDeletedForUser { .. }))
        );

        let err = engine
            .pipeline
            .delete_for_me(&message.id, "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_pin_and_unpin_keep_index_consistent() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "important").await;

        let pinned = engine
            .pipeline
            .pin(&conversation.id, &message.id, "bob")
            .await
            .unwrap();
        assert!(pinned.pinned);
        assert_eq!(pinned.pinned_by.as_deref(), Some("bob"));
        assert_eq!(
            engine.conversation(&conversation.id).await.pinned_message_ids,
            vec![message.id.clone()]
        );

        let views = engine
            .pipeline
            .pinned_messages(&conversation.id, "alice")
            .await
            .unwrap();
        assert_eq!(views.len(), 1);

        let unpinned = engine
            .pipeline
            .unpin(&conversation.id, &message.id, "alice")
            .await
            .unwrap();
        assert!(!unpinned.pinned);
        assert!(
            engine
                .conversation(&conversation.id)
                .await
                .pinned_message_ids
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_pinned_messages_list_latest_pin_first() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let older = engine.send_text(&conversation.id, "alice", "older").await;
        let newer = engine.send_text(&conversation.id, "alice", "newer").await;

        for message_id in [&newer.id, &older.id] {
            engine
                .pipeline
                .pin(&conversation.id, message_id, "bob")
                .await
                .unwrap();
        }

        let views = engine
            .pipeline
            .pinned_messages(&conversation.id, "alice")
            .await
            .unwrap();
        let ids: Vec<&str> = views.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec![older.id.as_str(), newer.id.as_str()]);
    }

    #[tokio::test]
    async fn test_pin_survives_system_log_failure() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "agenda").await;
        engine.messages.fail_system_logs(true);

        let pinned = engine
            .pipeline
            .pin(&conversation.id, &message.id, "bob")
            .await
            .unwrap();
        assert!(pinned.pinned);
        assert_eq!(
            engine.conversation(&conversation.id).await.pinned_message_ids,
            vec![message.id.clone()]
        );
        assert!(
            engine
                .publisher
                .events_for(&Destination::ConversationTopic(conversation.id.clone()))
                .iter()
                .any(|e| matches!(e.event, ChatEvent::MessagePinned { .. }))
        );

        let unpinned = engine
            .pipeline
            .unpin(&conversation.id, &message.id, "alice")
            .await
            .unwrap();
        assert!(!unpinned.pinned);
        assert!(!engine.message(&message.id).await.pinned);
    }

    #[tokio::test]
    async fn test_reconcile_pins_rebuilds_index() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "keep").await;
        engine
            .pipeline
            .pin(&conversation.id, &message.id, "alice")
            .await
            .unwrap();

        engine
            .store
            .replace_pinned_messages(&conversation.id, &["stale".to_string()])
            .await
            .unwrap();
        let ids = engine.pipeline.reconcile_pins(&conversation.id).await.unwrap();
        assert_eq!(ids, vec![message.id.clone()]);
        assert_eq!(
            engine.conversation(&conversation.id).await.pinned_message_ids,
            vec![message.id]
        );
    }

    #[tokio::test]
    async fn test_single_reaction_per_user() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "nice").await;

        engine
            .pipeline
            .add_reaction(&message.id, "bob", "👍")
            .await
            .unwrap();
        let updated = engine
            .pipeline
            .add_reaction(&message.id, "bob", "🎉")
            .await
            .unwrap();
        assert!(updated.reactions["🎉"].contains("bob"));
        assert!(!updated.reactions.contains_key("👍"));

        let events: Vec<&'static str> = engine
            .publisher
            .events_for(&Destination::ConversationTopic(conversation.id.clone()))
            .iter()
            .map(|e| e.event.kind())
            .filter(|kind| kind.starts_with("reaction"))
            .collect();
        assert_eq!(
            events,
            vec!["reaction_added", "reaction_removed", "reaction_added"]
        );

        let same = engine
            .pipeline
            .add_reaction(&message.id, "bob", "🎉")
            .await
            .unwrap();
        assert_eq!(same.reactions["🎉"].len(), 1);

        let cleared = engine
            .pipeline
            .remove_reaction(&message.id, "bob")
            .await
            .unwrap();
        assert!(cleared.reactions.is_empty());

        for emoji in ["  ", "a.b", "$set"] {
            let err = engine
                .pipeline
                .add_reaction(&message.id, "bob", emoji)
                .await
                .unwrap_err();
            assert!(matches!(err, ChatError::InvalidArgument(_)));
        }
        assert!(engine.message(&message.id).await.reactions.is_empty());
    }

    #[tokio::test]
    async fn test_recalled_message_stays_masked_for_pin_and_reaction() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "SECRET-TEXT").await;
        engine.pipeline.recall(&message.id, "alice").await.unwrap();

        let pinned = engine
            .pipeline
            .pin(&conversation.id, &message.id, "bob")
            .await
            .unwrap();
        assert!(pinned.pinned);
        assert_eq!(pinned.content, RECALLED_PLACEHOLDER);

        let reacted = engine
            .pipeline
            .add_reaction(&message.id, "bob", "👍")
            .await
            .unwrap();
        assert_eq!(reacted.content, RECALLED_PLACEHOLDER);
        assert!(reacted.reactions["👍"].contains("bob"));

        // 重复操作走空操作分支，同样只返回占位内容
        let again = engine
            .pipeline
            .add_reaction(&message.id, "bob", "👍")
            .await
            .unwrap();
        assert_eq!(again.content, RECALLED_PLACEHOLDER);
        let unpinned = engine
            .pipeline
            .unpin(&conversation.id, &message.id, "bob")
            .await
            .unwrap();
        assert_eq!(unpinned.content, RECALLED_PLACEHOLDER);
        let cleared = engine
            .pipeline
            .remove_reaction(&message.id, "bob")
            .await
            .unwrap();
        assert_eq!(cleared.content, RECALLED_PLACEHOLDER);
    }

    #[tokio::test]
    async fn test_actions_on_message_deleted_for_actor_are_not_found() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let message = engine.send_text(&conversation.id, "alice", "gone").await;
        engine.pipeline.delete_for_me(&message.id, "bob").await.unwrap();

        let err = engine
            .pipeline
            .pin(&conversation.id, &message.id, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let err = engine
            .pipeline
            .add_reaction(&message.id, "bob", "👍")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(!engine.message(&message.id).await.pinned);
    }

    #[tokio::test]
    async fn test_typing_goes_to_topic_only() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        engine
            .pipeline
            .typing(&conversation.id, "alice", true)
            .await
            .unwrap();

        assert!(
            engine
                .publisher
                .events_for(&Destination::ConversationTopic(conversation.id.clone()))
                .iter()
                .any(|e| matches!(e.event, ChatEvent::Typing { typing: true, .. }))
        );
        assert!(
            engine
                .publisher
                .events_for(&Destination::UserTopic("bob".to_string()))
                .iter()
                .all(|e| !matches!(e.event, ChatEvent::Typing { .. }))
        );
    }
}
