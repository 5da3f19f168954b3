//! 会话目录服务
//!
//! 会话生命周期：创建、DIRECT 成员对解析、成员管理、群资料、删除，
//! 以及会话级的用户偏好（置顶会话、免打扰、手动未读）。

use std::cmp::Reverse;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::domain::model::{
    ChatEvent, Conversation, ConversationKind, ConversationMetaUpdate, ConversationPreference,
    ConversationSummary, ConversationView,
};
use crate::domain::repository::{ConversationRepository, MessageRepository, UserDirectory};
use crate::domain::service::delivery::MessageDelivery;
use crate::domain::service::derived_state::DerivedStateCalculator;
use crate::domain::service::fanout::FanoutService;
use crate::domain::service::{load_conversation, load_for_member, non_empty};
use crate::error::{ChatError, Result};

/// 创建会话参数
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub creator_id: String,
    pub members: Vec<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

pub struct ConversationDirectoryService {
    conversation_repo: Arc<dyn ConversationRepository>,
    message_repo: Arc<dyn MessageRepository>,
    delivery: Arc<MessageDelivery>,
    fanout: Arc<FanoutService>,
    derived: DerivedStateCalculator,
    users: Arc<dyn UserDirectory>,
}

impl ConversationDirectoryService {
    pub fn new(
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        delivery: Arc<MessageDelivery>,
        fanout: Arc<FanoutService>,
        derived: DerivedStateCalculator,
        users: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            conversation_repo,
            message_repo,
            delivery,
            fanout,
            derived,
            users,
        }
    }

    /// 创建会话
    ///
    /// GROUP：保证创建者为成员，写入“建群”系统日志，若有其他成员再写入一条
    /// 合并的“拉人”系统日志，最后向每个成员的个人频道广播 `conversation_created`。
    /// DIRECT 会话不在此创建，只在首条消息发送时惰性创建。
    #[instrument(skip(self, request), fields(creator_id = %request.creator_id, kind = request.kind.as_str()))]
    pub async fn create_conversation(&self, request: NewConversation) -> Result<Conversation> {
        non_empty(&request.creator_id, "creator_id")?;

        match request.kind {
            ConversationKind::Direct => Err(ChatError::invalid_argument(
                "direct conversations are created by sending the first message (send_direct)",
            )),
            ConversationKind::Group => self.create_group(request).await,
        }
    }

    async fn create_group(&self, request: NewConversation) -> Result<Conversation> {
        let conversation = Conversation::new_group(
            ulid::Ulid::new().to_string(),
            &request.creator_id,
            &request.members,
            request.name.clone(),
            request.description,
            request.avatar_url,
            Utc::now(),
        );
        self.conversation_repo.insert(&conversation).await?;

        let creator_name = self.display_name(&conversation.created_by).await;
        let created_log = match &conversation.name {
            Some(name) => format!("{creator_name} created the group \"{name}\""),
            None => format!("{creator_name} created the group"),
        };
        self.delivery
            .system_log(&conversation, &conversation.created_by, created_log)
            .await?;

        let others: Vec<&String> = conversation
            .members
            .iter()
            .filter(|m| **m != conversation.created_by)
            .collect();
        if !others.is_empty() {
            let mut names = Vec::with_capacity(others.len());
            for member in others {
                names.push(self.display_name(member).await);
            }
            let added_log = format!("{creator_name} added {} to the group", names.join(", "));
            self.delivery
                .system_log(&conversation, &conversation.created_by, added_log)
                .await?;
        }

        info!(
            conversation_id = %conversation.id,
            members = conversation.members.len(),
            "Group conversation created"
        );

        self.announce_created(&conversation).await;
        Ok(conversation)
    }

    /// 获取或惰性创建 DIRECT 会话，返回 (会话, 是否新建)
    pub(crate) async fn ensure_direct(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> Result<(Conversation, bool)> {
        if user_a == user_b {
            return Err(ChatError::invalid_argument(
                "direct conversation requires two distinct users",
            ));
        }
        if let Some(existing) = self.conversation_repo.find_direct(user_a, user_b).await? {
            return Ok((existing, false));
        }

        let candidate =
            Conversation::new_direct(ulid::Ulid::new().to_string(), user_a, user_b, Utc::now());
        let stored = self
            .conversation_repo
            .insert_direct_if_absent(&candidate)
            .await?;
        let created = stored.id == candidate.id;
        if created {
            info!(conversation_id = %stored.id, user_a = %user_a, user_b = %user_b, "Direct conversation created");
        }
        Ok((stored, created))
    }

    pub(crate) async fn announce_created(&self, conversation: &Conversation) {
        self.fanout
            .notify_members(
                ChatEvent::ConversationCreated {
                    conversation: conversation.shared_view(),
                },
                &conversation.id,
                &conversation.members,
            )
            .await;
    }

    /// 查找成员对 {a, b} 的 DIRECT 会话（以 a 的视角返回）；从不创建
    pub async fn resolve_direct(&self, user_a: &str, user_b: &str) -> Result<ConversationView> {
        self.conversation_repo
            .find_direct(user_a, user_b)
            .await?
            .map(|conversation| conversation.view_for(user_a))
            .ok_or_else(|| {
                ChatError::not_found(format!("direct conversation between {user_a} and {user_b}"))
            })
    }

    /// 成员读取会话，只包含请求者自己的标注
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        actor_id: &str,
    ) -> Result<ConversationView> {
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, actor_id).await?;
        Ok(conversation.view_for(actor_id))
    }

    /// 侧边栏会话列表：置顶会话优先，其次按最近活跃时间倒序
    pub async fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationSummary>> {
        let conversations = self.conversation_repo.list_for_member(user_id).await?;
        let mut summaries = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let latest_message = self.derived.latest_preview(&conversation.id, user_id).await?;
            let unread_count = self.derived.unread_count(&conversation.id, user_id).await?;
            let display_name = match (&conversation.name, conversation.direct_peer(user_id)) {
                (Some(name), _) => Some(name.clone()),
                (None, Some(peer)) => Some(self.display_name(peer).await),
                (None, None) => None,
            };
            let last_activity_at = latest_message
                .as_ref()
                .map(|m| m.sent_at.max(conversation.updated_at))
                .unwrap_or(conversation.updated_at);

            summaries.push(ConversationSummary {
                pinned: conversation.is_pinned_by(user_id),
                muted: conversation.is_muted_by(user_id),
                manually_unread: conversation.is_manually_unread(user_id),
                display_name,
                latest_message,
                unread_count,
                last_activity_at,
                conversation: conversation.shared_view(),
            });
        }

        summaries.sort_by_key(|s| (Reverse(s.pinned), Reverse(s.last_activity_at)));
        Ok(summaries)
    }

    /// 添加成员（仅 GROUP，操作者须为成员）
    #[instrument(skip(self))]
    pub async fn add_member(
        &self,
        conversation_id: &str,
        user_id: &str,
        actor_id: &str,
    ) -> Result<Conversation> {
        non_empty(user_id, "user_id")?;
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, actor_id).await?;
        if !conversation.is_group() {
            return Err(ChatError::invalid_argument(
                "members can only be added to group conversations",
            ));
        }
        if conversation.is_member(user_id) {
            debug!(conversation_id = %conversation_id, user_id = %user_id, "User already a member");
            return Ok(conversation);
        }

        self.conversation_repo
            .add_member(conversation_id, user_id)
            .await?;
        let updated = load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;

        let actor_name = self.display_name(actor_id).await;
        let user_name = self.display_name(user_id).await;
        self.delivery
            .system_log(
                &updated,
                actor_id,
                format!("{actor_name} added {user_name} to the group"),
            )
            .await?;

        self.fanout
            .broadcast(
                ChatEvent::MemberAdded {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                    actor_id: actor_id.to_string(),
                },
                &updated,
            )
            .await;

        info!(conversation_id = %conversation_id, user_id = %user_id, "Member added");
        Ok(updated)
    }

    /// 移除成员：仅允许本人退出或创建者移除
    #[instrument(skip(self))]
    pub async fn remove_member(
        &self,
        conversation_id: &str,
        user_id: &str,
        actor_id: &str,
    ) -> Result<Conversation> {
        let conversation = load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;
        if actor_id != user_id && actor_id != conversation.created_by {
            return Err(ChatError::permission_denied(format!(
                "user {actor_id} may not remove {user_id} from conversation {conversation_id}"
            )));
        }
        if !conversation.is_group() {
            return Err(ChatError::invalid_argument(
                "members can only be removed from group conversations",
            ));
        }
        if !conversation.is_member(user_id) {
            return Err(ChatError::not_found(format!(
                "member {user_id} in conversation {conversation_id}"
            )));
        }
        // 群组始终包含创建者；创建者离开请删除群会话
        if user_id == conversation.created_by {
            return Err(ChatError::invalid_argument(
                "the creator cannot leave the group; delete the conversation instead",
            ));
        }

        self.conversation_repo
            .remove_member(conversation_id, user_id)
            .await?;
        let updated = load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;

        let user_name = self.display_name(user_id).await;
        let log = if actor_id == user_id {
            format!("{user_name} left the group")
        } else {
            let actor_name = self.display_name(actor_id).await;
            format!("{actor_name} removed {user_name} from the group")
        };
        self.delivery.system_log(&updated, actor_id, log).await?;

        // 被移除者也需要收到事件以刷新侧边栏
        self.fanout
            .broadcast_to(
                ChatEvent::MemberRemoved {
                    conversation_id: conversation_id.to_string(),
                    user_id: user_id.to_string(),
                    actor_id: actor_id.to_string(),
                },
                conversation_id,
                &conversation.members,
            )
            .await;

        info!(conversation_id = %conversation_id, user_id = %user_id, actor_id = %actor_id, "Member removed");
        Ok(updated)
    }

    /// 删除群会话：仅创建者；级联删除消息，再删除会话本身
    #[instrument(skip(self))]
    pub async fn delete_group_conversation(&self, conversation_id: &str, actor_id: &str) -> Result<()> {
        let conversation = load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;
        if !conversation.is_group() {
            return Err(ChatError::invalid_argument(
                "only group conversations can be deleted",
            ));
        }
        if conversation.created_by != actor_id {
            return Err(ChatError::permission_denied(format!(
                "only the creator may delete conversation {conversation_id}"
            )));
        }

        let removed = self
            .message_repo
            .delete_by_conversation(conversation_id)
            .await?;
        self.conversation_repo.delete(conversation_id).await?;

        info!(
            conversation_id = %conversation_id,
            messages_removed = removed,
            "Group conversation deleted"
        );

        self.fanout
            .broadcast(
                ChatEvent::ConversationDeleted {
                    conversation_id: conversation_id.to_string(),
                },
                &conversation,
            )
            .await;
        Ok(())
    }

    /// 更新群资料（成员可操作）
    #[instrument(skip(self, update))]
    pub async fn update_group_info(
        &self,
        conversation_id: &str,
        actor_id: &str,
        update: ConversationMetaUpdate,
    ) -> Result<Conversation> {
        if update.is_empty() {
            return Err(ChatError::invalid_argument("nothing to update"));
        }
        let conversation =
            load_for_member(self.conversation_repo.as_ref(), conversation_id, actor_id).await?;
        if !conversation.is_group() {
            return Err(ChatError::invalid_argument(
                "only group conversations carry group info",
            ));
        }

        self.conversation_repo
            .update_meta(conversation_id, &update, Utc::now())
            .await?;
        let updated = load_conversation(self.conversation_repo.as_ref(), conversation_id).await?;

        let actor_name = self.display_name(actor_id).await;
        let log = match &update.name {
            Some(name) => format!("{actor_name} renamed the group to \"{name}\""),
            None => format!("{actor_name} updated the group info"),
        };
        self.delivery.system_log(&updated, actor_id, log).await?;

        self.fanout
            .broadcast(
                ChatEvent::ConversationMetaUpdated {
                    conversation: updated.shared_view(),
                },
                &updated,
            )
            .await;
        Ok(updated)
    }

    pub async fn set_conversation_pinned(
        &self,
        conversation_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> Result<()> {
        self.set_preference(conversation_id, user_id, ConversationPreference::Pinned, pinned)
            .await
    }

    pub async fn set_muted(&self, conversation_id: &str, user_id: &str, muted: bool) -> Result<()> {
        self.set_preference(conversation_id, user_id, ConversationPreference::Muted, muted)
            .await
    }

    /// 手动标记未读（任何真实的已读行为都会清除该标记）
    pub async fn mark_unread(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.set_preference(
            conversation_id,
            user_id,
            ConversationPreference::ManuallyUnread,
            true,
        )
        .await
    }

    async fn set_preference(
        &self,
        conversation_id: &str,
        user_id: &str,
        preference: ConversationPreference,
        enabled: bool,
    ) -> Result<()> {
        load_for_member(self.conversation_repo.as_ref(), conversation_id, user_id).await?;
        self.conversation_repo
            .set_preference(conversation_id, user_id, preference, enabled)
            .await?;

        debug!(
            conversation_id = %conversation_id,
            user_id = %user_id,
            preference = ?preference,
            enabled = enabled,
            "Conversation preference updated"
        );

        let latest_message = self.derived.latest_preview(conversation_id, user_id).await?;
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
        Ok(())
    }

    /// 展示名解析失败时退化为用户ID
    pub(crate) async fn display_name(&self, user_id: &str) -> String {
        match self.users.display_name(user_id).await {
            Ok(Some(name)) => name,
            Ok(None) => user_id.to_string(),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "Failed to resolve display name");
                user_id.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ChatEvent, Destination, MessageKind};
    use crate::domain::repository::MessageFilter;
    use crate::domain::service::test_support::TestEngine;

    #[tokio::test]
    async fn test_create_group_writes_system_logs_and_announces() {
        let engine = TestEngine::new();
        engine.users.insert("alice", "Alice");
        engine.users.insert("bob", "Bob");
        engine.users.insert("carol", "Carol");

        let conversation = engine
            .directory
            .create_conversation(NewConversation {
                kind: ConversationKind::Group,
                creator_id: "alice".to_string(),
                members: vec!["bob".to_string(), "carol".to_string()],
                name: Some("Team".to_string()),
                description: None,
                avatar_url: None,
            })
            .await
            .unwrap();

        assert_eq!(conversation.members, vec!["alice", "bob", "carol"]);

        let logs = engine
            .store
            .query(&MessageFilter::conversation(&conversation.id).oldest_first())
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|m| m.kind == MessageKind::SystemLog));
        assert_eq!(logs[0].content, "Alice created the group \"Team\"");
        assert_eq!(logs[1].content, "Alice added Bob, Carol to the group");

        for member in ["alice", "bob", "carol"] {
            let events = engine
                .publisher
                .events_for(&Destination::UserTopic(member.to_string()));
            assert!(
                events
                    .iter()
                    .any(|e| matches!(e.event, ChatEvent::ConversationCreated { .. }))
            );
        }
    }

    #[tokio::test]
    async fn test_group_without_other_members_has_single_log() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &[]).await;
        let count = engine
            .store
            .count(&MessageFilter::conversation(&conversation.id))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_resolve_direct_never_creates() {
        let engine = TestEngine::new();
        for _ in 0..2 {
            let err = engine.directory.resolve_direct("a", "b").await.unwrap_err();
            assert!(matches!(err, ChatError::NotFound(_)));
        }
        assert!(engine.store.list_for_member("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_direct_conversation_is_not_created_eagerly() {
        let engine = TestEngine::new();
        let err = engine
            .directory
            .create_conversation(NewConversation {
                kind: ConversationKind::Direct,
                creator_id: "alice".to_string(),
                members: vec!["bob".to_string()],
                name: None,
                description: None,
                avatar_url: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));

        let err = engine
            .directory
            .resolve_direct("alice", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(engine.store.list_for_member("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_creator_cannot_leave_group() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;

        let err = engine
            .directory
            .remove_member(&conversation.id, "alice", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));

        let stored = engine.conversation(&conversation.id).await;
        assert_eq!(stored.members, vec!["alice", "bob"]);
        assert_eq!(stored.created_by, "alice");
    }

    #[tokio::test]
    async fn test_conversation_views_hide_other_members_preferences() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        engine
            .directory
            .set_muted(&conversation.id, "alice", true)
            .await
            .unwrap();
        engine
            .directory
            .set_conversation_pinned(&conversation.id, "alice", true)
            .await
            .unwrap();

        let bob_view = engine
            .directory
            .get_conversation(&conversation.id, "bob")
            .await
            .unwrap();
        let viewer = bob_view.viewer.clone().unwrap();
        assert_eq!(viewer.user_id, "bob");
        assert!(!viewer.muted);
        assert!(!viewer.pinned);

        let raw = serde_json::to_value(&bob_view).unwrap();
        assert!(raw.get("muted_by_users").is_none());
        assert!(raw.get("pinned_by_users").is_none());

        let alice_view = engine
            .directory
            .get_conversation(&conversation.id, "alice")
            .await
            .unwrap();
        assert!(alice_view.viewer.unwrap().muted);

        // 推送给成员的会话事件只带共享字段
        engine
            .directory
            .update_group_info(
                &conversation.id,
                "alice",
                ConversationMetaUpdate {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let events = engine
            .publisher
            .events_for(&Destination::UserTopic("bob".to_string()));
        let shared: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.event {
                ChatEvent::ConversationCreated { conversation }
                | ChatEvent::ConversationMetaUpdated { conversation } => Some(conversation),
                _ => None,
            })
            .collect();
        assert_eq!(shared.len(), 2);
        assert!(shared.iter().all(|c| c.viewer.is_none()));
    }

    #[tokio::test]
    async fn test_remove_member_permissions() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob", "carol"]).await;

        let err = engine
            .directory
            .remove_member(&conversation.id, "carol", "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        // 本人退出
        let updated = engine
            .directory
            .remove_member(&conversation.id, "bob", "bob")
            .await
            .unwrap();
        assert!(!updated.is_member("bob"));

        // 创建者移除
        let updated = engine
            .directory
            .remove_member(&conversation.id, "carol", "alice")
            .await
            .unwrap();
        assert_eq!(updated.members, vec!["alice"]);

        let removed_events = engine
            .publisher
            .events_for(&Destination::UserTopic("carol".to_string()));
        assert!(
            removed_events
                .iter()
                .any(|e| matches!(e.event, ChatEvent::MemberRemoved { .. }))
        );
    }

    #[tokio::test]
    async fn test_add_member_requires_membership_and_is_idempotent() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;

        let err = engine
            .directory
            .add_member(&conversation.id, "carol", "mallory")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        let updated = engine
            .directory
            .add_member(&conversation.id, "carol", "bob")
            .await
            .unwrap();
        assert!(updated.is_member("carol"));

        let before = engine
            .store
            .count(&MessageFilter::conversation(&conversation.id))
            .await
            .unwrap();
        engine
            .directory
            .add_member(&conversation.id, "carol", "bob")
            .await
            .unwrap();
        let after = engine
            .store
            .count(&MessageFilter::conversation(&conversation.id))
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_delete_group_conversation_cascades() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        engine.send_text(&conversation.id, "bob", "hello").await;

        let err = engine
            .directory
            .delete_group_conversation(&conversation.id, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::PermissionDenied(_)));

        engine
            .directory
            .delete_group_conversation(&conversation.id, "alice")
            .await
            .unwrap();

        let err = engine
            .directory
            .get_conversation(&conversation.id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(
            engine
                .store
                .count(&MessageFilter::conversation(&conversation.id))
                .await
                .unwrap(),
            0
        );
        let events = engine
            .publisher
            .events_for(&Destination::UserTopic("bob".to_string()));
        assert!(
            events
                .iter()
                .any(|e| matches!(e.event, ChatEvent::ConversationDeleted { .. }))
        );
    }

    #[tokio::test]
    async fn test_list_conversations_orders_pinned_first() {
        let engine = TestEngine::new();
        let first = engine.group("alice", &["bob"]).await;
        let second = engine.group("alice", &["bob"]).await;
        engine.send_text(&second.id, "bob", "latest").await;

        let summaries = engine.directory.list_conversations("alice").await.unwrap();
        assert_eq!(summaries[0].conversation.id, second.id);
        assert_eq!(summaries[0].unread_count, 1);

        engine
            .directory
            .set_conversation_pinned(&first.id, "alice", true)
            .await
            .unwrap();
        let summaries = engine.directory.list_conversations("alice").await.unwrap();
        assert_eq!(summaries[0].conversation.id, first.id);
        assert!(summaries[0].pinned);
    }

    #[tokio::test]
    async fn test_update_group_info() {
        let engine = TestEngine::new();
        let conversation = engine.group("alice", &["bob"]).await;
        let updated = engine
            .directory
            .update_group_info(
                &conversation.id,
                "bob",
                ConversationMetaUpdate {
                    name: Some("Renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name.as_deref(), Some("Renamed"));

        let err = engine
            .directory
            .update_group_info(&conversation.id, "bob", ConversationMetaUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidArgument(_)));
    }
}
