use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::application::commands::{
    AddReactionCommand, CreateConversationCommand, DeleteConversationCommand, EditMessageCommand,
    MarkReadCommand, MemberCommand, MessageActionCommand, PinMessageCommand, PreferenceChange,
    SendDirectCommand, SendMessageCommand, TypingCommand, UpdateGroupInfoCommand,
    UpdatePreferenceCommand,
};
use crate::application::queries::{
    AroundMessageQuery, BetweenMessagesQuery, ConversationScopedQuery, GetConversationQuery,
    GetMessagesQuery, ListConversationsQuery, ResolveDirectQuery, SearchMessagesQuery,
};
use crate::domain::model::{
    ConversationSummary, ConversationView, Message, MessagePage, MessageView, SearchResult,
};
use crate::domain::service::{
    ConversationDirectoryService, MessagePipelineService, MessageQueryService, NewConversation,
    OutgoingMessage, ReadTrackingService,
};
use crate::error::Result;
use crate::metrics::CHAT_METRICS;

/// 记录变更操作的次数、结果与耗时
async fn observed<T, F>(operation: &'static str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = future.await;
    CHAT_METRICS.record_mutation(operation, result.is_ok(), started.elapsed().as_secs_f64());
    result
}

/// 会话命令处理器
pub struct ChatCommandHandler {
    directory: Arc<ConversationDirectoryService>,
    pipeline: Arc<MessagePipelineService>,
    read_tracking: Arc<ReadTrackingService>,
}

impl ChatCommandHandler {
    pub fn new(
        directory: Arc<ConversationDirectoryService>,
        pipeline: Arc<MessagePipelineService>,
        read_tracking: Arc<ReadTrackingService>,
    ) -> Self {
        Self {
            directory,
            pipeline,
            read_tracking,
        }
    }

    /// 处理创建会话命令
    pub async fn handle_create_conversation(
        &self,
        command: CreateConversationCommand,
    ) -> Result<ConversationView> {
        debug!(
            actor_id = %command.actor_id,
            kind = command.kind.as_str(),
            members = command.members.len(),
            "Handling create conversation command"
        );

        let actor_id = command.actor_id.clone();
        let conversation = observed(
            "create_conversation",
            self.directory.create_conversation(NewConversation {
                kind: command.kind,
                creator_id: command.actor_id,
                members: command.members,
                name: command.name,
                description: command.description,
                avatar_url: command.avatar_url,
            }),
        )
        .await?;

        info!(conversation_id = %conversation.id, "Conversation created");
        Ok(conversation.view_for(&actor_id))
    }

    pub async fn handle_add_member(&self, command: MemberCommand) -> Result<ConversationView> {
        debug!(
            conversation_id = %command.conversation_id,
            user_id = %command.user_id,
            actor_id = %command.actor_id,
            "Handling add member command"
        );

        let conversation = observed(
            "add_member",
            self.directory.add_member(
                &command.conversation_id,
                &command.user_id,
                &command.actor_id,
            ),
        )
        .await?;
        Ok(conversation.view_for(&command.actor_id))
    }

    pub async fn handle_remove_member(&self, command: MemberCommand) -> Result<ConversationView> {
        debug!(
            conversation_id = %command.conversation_id,
            user_id = %command.user_id,
            actor_id = %command.actor_id,
            "Handling remove member command"
        );

        let conversation = observed(
            "remove_member",
            self.directory.remove_member(
                &command.conversation_id,
                &command.user_id,
                &command.actor_id,
            ),
        )
        .await?;
        Ok(conversation.view_for(&command.actor_id))
    }

    /// 处理删除群会话命令
    pub async fn handle_delete_conversation(&self, command: DeleteConversationCommand) -> Result<()> {
        debug!(
            conversation_id = %command.conversation_id,
            actor_id = %command.actor_id,
            "Handling delete conversation command"
        );

        observed(
            "delete_conversation",
            self.directory
                .delete_group_conversation(&command.conversation_id, &command.actor_id),
        )
        .await?;

        info!(conversation_id = %command.conversation_id, "Conversation deleted");
        Ok(())
    }

    pub async fn handle_update_group_info(
        &self,
        command: UpdateGroupInfoCommand,
    ) -> Result<ConversationView> {
        debug!(
            conversation_id = %command.conversation_id,
            actor_id = %command.actor_id,
            "Handling update group info command"
        );

        let conversation = observed(
            "update_group_info",
            self.directory.update_group_info(
                &command.conversation_id,
                &command.actor_id,
                command.update,
            ),
        )
        .await?;
        Ok(conversation.view_for(&command.actor_id))
    }

    /// 处理会话标注（置顶会话、免打扰、标记未读）
    pub async fn handle_update_preference(&self, command: UpdatePreferenceCommand) -> Result<()> {
        debug!(
            conversation_id = %command.conversation_id,
            user_id = %command.user_id,
            change = ?command.change,
            "Handling update preference command"
        );

        let conversation_id = command.conversation_id.as_str();
        let user_id = command.user_id.as_str();
        match command.change {
            PreferenceChange::Pinned(pinned) => {
                observed(
                    "set_conversation_pinned",
                    self.directory
                        .set_conversation_pinned(conversation_id, user_id, pinned),
                )
                .await
            }
            PreferenceChange::Muted(muted) => {
                observed(
                    "set_muted",
                    self.directory.set_muted(conversation_id, user_id, muted),
                )
                .await
            }
            PreferenceChange::MarkUnread => {
                observed(
                    "mark_unread",
                    self.directory.mark_unread(conversation_id, user_id),
                )
                .await
            }
        }
    }

    /// 处理发送消息命令（含回复）
    pub async fn handle_send_message(&self, command: SendMessageCommand) -> Result<Message> {
        debug!(
            conversation_id = %command.conversation_id,
            sender_id = %command.sender_id,
            kind = command.kind.as_str(),
            reply_to = ?command.reply_to,
            "Handling send message command"
        );

        let message = observed(
            "send",
            self.pipeline.send(OutgoingMessage {
                conversation_id: command.conversation_id,
                sender_id: command.sender_id,
                content: command.content,
                kind: command.kind,
                sent_at: None,
                reply_to: command.reply_to,
            }),
        )
        .await?;

        info!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            "Message sent"
        );
        Ok(message)
    }

    pub async fn handle_send_direct(&self, command: SendDirectCommand) -> Result<Message> {
        debug!(
            sender_id = %command.sender_id,
            recipient_id = %command.recipient_id,
            "Handling send direct command"
        );

        let message = observed(
            "send_direct",
            self.pipeline.send_direct(
                &command.sender_id,
                &command.recipient_id,
                &command.content,
                command.kind,
            ),
        )
        .await?;

        info!(
            conversation_id = %message.conversation_id,
            message_id = %message.id,
            "Direct message sent"
        );
        Ok(message)
    }

    pub async fn handle_edit_message(&self, command: EditMessageCommand) -> Result<Message> {
        debug!(
            message_id = %command.message_id,
            editor_id = %command.editor_id,
            "Handling edit message command"
        );

        observed(
            "edit",
            self.pipeline
                .edit(&command.message_id, &command.editor_id, &command.content),
        )
        .await
    }

    /// 处理撤回命令
    pub async fn handle_recall(&self, command: MessageActionCommand) -> Result<Message> {
        debug!(
            message_id = %command.message_id,
            actor_id = %command.actor_id,
            "Handling recall command"
        );

        let message = observed(
            "recall",
            self.pipeline.recall(&command.message_id, &command.actor_id),
        )
        .await?;

        info!(message_id = %message.id, "Message recalled");
        Ok(message)
    }

    pub async fn handle_delete_for_me(&self, command: MessageActionCommand) -> Result<()> {
        debug!(
            message_id = %command.message_id,
            user_id = %command.actor_id,
            "Handling delete for me command"
        );

        observed(
            "delete_for_me",
            self.pipeline
                .delete_for_me(&command.message_id, &command.actor_id),
        )
        .await
    }

    /// 处理置顶 / 取消置顶命令
    pub async fn handle_pin(&self, command: PinMessageCommand) -> Result<MessageView> {
        debug!(
            conversation_id = %command.conversation_id,
            message_id = %command.message_id,
            actor_id = %command.actor_id,
            pinned = command.pinned,
            "Handling pin command"
        );

        if command.pinned {
            observed(
                "pin",
                self.pipeline.pin(
                    &command.conversation_id,
                    &command.message_id,
                    &command.actor_id,
                ),
            )
            .await
        } else {
            observed(
                "unpin",
                self.pipeline.unpin(
                    &command.conversation_id,
                    &command.message_id,
                    &command.actor_id,
                ),
            )
            .await
        }
    }

    pub async fn handle_add_reaction(&self, command: AddReactionCommand) -> Result<MessageView> {
        debug!(
            message_id = %command.message_id,
            user_id = %command.user_id,
            emoji = %command.emoji,
            "Handling add reaction command"
        );

        observed(
            "add_reaction",
            self.pipeline
                .add_reaction(&command.message_id, &command.user_id, &command.emoji),
        )
        .await
    }

    pub async fn handle_remove_reaction(&self, command: MessageActionCommand) -> Result<MessageView> {
        debug!(
            message_id = %command.message_id,
            user_id = %command.actor_id,
            "Handling remove reaction command"
        );

        observed(
            "remove_reaction",
            self.pipeline
                .remove_reaction(&command.message_id, &command.actor_id),
        )
        .await
    }

    /// 处理标记已读命令，返回新增已读条数
    pub async fn handle_mark_read(&self, command: MarkReadCommand) -> Result<u64> {
        debug!(
            conversation_id = %command.conversation_id,
            user_id = %command.user_id,
            last_message_id = ?command.last_message_id,
            "Handling mark read command"
        );

        let marked = match command.last_message_id.as_deref() {
            Some(last_message_id) => {
                observed(
                    "mark_as_read",
                    self.read_tracking.mark_as_read_with_last_message(
                        &command.conversation_id,
                        &command.user_id,
                        last_message_id,
                    ),
                )
                .await?
            }
            None => {
                observed(
                    "mark_as_read",
                    self.read_tracking
                        .mark_as_read(&command.conversation_id, &command.user_id),
                )
                .await?
            }
        };

        info!(
            conversation_id = %command.conversation_id,
            user_id = %command.user_id,
            marked,
            "Conversation marked as read"
        );
        Ok(marked)
    }

    pub async fn handle_typing(&self, command: TypingCommand) -> Result<()> {
        self.pipeline
            .typing(&command.conversation_id, &command.user_id, command.typing)
            .await
    }

    /// 以消息侧置顶标记重建会话置顶索引
    pub async fn handle_reconcile_pins(&self, conversation_id: &str) -> Result<Vec<String>> {
        debug!(conversation_id = %conversation_id, "Handling reconcile pins command");
        observed("reconcile_pins", self.pipeline.reconcile_pins(conversation_id)).await
    }
}

/// 会话查询处理器
pub struct ChatQueryHandler {
    directory: Arc<ConversationDirectoryService>,
    pipeline: Arc<MessagePipelineService>,
    read_tracking: Arc<ReadTrackingService>,
    query: Arc<MessageQueryService>,
}

impl ChatQueryHandler {
    pub fn new(
        directory: Arc<ConversationDirectoryService>,
        pipeline: Arc<MessagePipelineService>,
        read_tracking: Arc<ReadTrackingService>,
        query: Arc<MessageQueryService>,
    ) -> Self {
        Self {
            directory,
            pipeline,
            read_tracking,
            query,
        }
    }

    pub async fn handle_list_conversations(
        &self,
        query: ListConversationsQuery,
    ) -> Result<Vec<ConversationSummary>> {
        debug!(user_id = %query.user_id, "Handling list conversations query");
        self.directory.list_conversations(&query.user_id).await
    }

    pub async fn handle_get_conversation(&self, query: GetConversationQuery) -> Result<ConversationView> {
        self.directory
            .get_conversation(&query.conversation_id, &query.user_id)
            .await
    }

    pub async fn handle_resolve_direct(&self, query: ResolveDirectQuery) -> Result<ConversationView> {
        self.directory
            .resolve_direct(&query.user_id, &query.peer_id)
            .await
    }

    /// 处理游标分页查询
    pub async fn handle_get_messages(&self, query: GetMessagesQuery) -> Result<MessagePage> {
        debug!(
            conversation_id = %query.conversation_id,
            user_id = %query.user_id,
            cursor = ?query.cursor,
            limit = ?query.limit,
            "Handling get messages query"
        );

        self.query
            .get_messages_for_user(
                &query.conversation_id,
                &query.user_id,
                query.cursor,
                query.limit,
            )
            .await
    }

    pub async fn handle_around_message(&self, query: AroundMessageQuery) -> Result<Vec<MessageView>> {
        self.query
            .around_message(
                &query.conversation_id,
                &query.user_id,
                &query.message_id,
                query.before,
                query.after,
            )
            .await
    }

    pub async fn handle_between(&self, query: BetweenMessagesQuery) -> Result<Vec<MessageView>> {
        self.query
            .between(
                &query.conversation_id,
                &query.user_id,
                &query.from_message_id,
                &query.to_message_id,
            )
            .await
    }

    pub async fn handle_search(&self, query: SearchMessagesQuery) -> Result<SearchResult> {
        debug!(
            conversation_id = %query.conversation_id,
            user_id = %query.user_id,
            keyword = %query.keyword,
            "Handling search query"
        );

        self.query
            .search(
                &query.conversation_id,
                &query.user_id,
                &query.keyword,
                query.offset,
                query.limit,
            )
            .await
    }

    pub async fn handle_unread_count(&self, query: ConversationScopedQuery) -> Result<u64> {
        self.read_tracking
            .unread_count(&query.conversation_id, &query.user_id)
            .await
    }

    pub async fn handle_pinned_messages(
        &self,
        query: ConversationScopedQuery,
    ) -> Result<Vec<MessageView>> {
        self.pipeline
            .pinned_messages(&query.conversation_id, &query.user_id)
            .await
    }
}
