//! 客户端动作分发
//!
//! 入站动作是带 `action` 标签的封闭枚举，在边界完成字段校验：
//! 未知动作或缺少必填字段一律返回 `INVALID_ARGUMENT`，不会被静默忽略。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::application::commands::{
    AddReactionCommand, CreateConversationCommand, DeleteConversationCommand, EditMessageCommand,
    MarkReadCommand, MemberCommand, MessageActionCommand, PinMessageCommand, PreferenceChange,
    SendDirectCommand, SendMessageCommand, TypingCommand, UpdateGroupInfoCommand,
    UpdatePreferenceCommand,
};
use crate::application::handlers::{ChatCommandHandler, ChatQueryHandler};
use crate::application::queries::{
    AroundMessageQuery, BetweenMessagesQuery, ConversationScopedQuery, GetConversationQuery,
    GetMessagesQuery, ListConversationsQuery, ResolveDirectQuery, SearchMessagesQuery,
};
use crate::domain::model::{ConversationKind, ConversationMetaUpdate, MessageKind};
use crate::domain::service::field_key;
use crate::error::{ChatError, Result};

/// 客户端动作
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    CreateConversation {
        kind: ConversationKind,
        #[serde(default)]
        members: Vec<String>,
        name: Option<String>,
        description: Option<String>,
        avatar_url: Option<String>,
    },
    ResolveDirect {
        peer_id: String,
    },
    GetConversation {
        conversation_id: String,
    },
    ListConversations,
    AddMember {
        conversation_id: String,
        user_id: String,
    },
    RemoveMember {
        conversation_id: String,
        user_id: String,
    },
    DeleteConversation {
        conversation_id: String,
    },
    UpdateGroupInfo {
        conversation_id: String,
        name: Option<String>,
        description: Option<String>,
        avatar_url: Option<String>,
    },
    SetConversationPinned {
        conversation_id: String,
        pinned: bool,
    },
    SetMuted {
        conversation_id: String,
        muted: bool,
    },
    MarkUnread {
        conversation_id: String,
    },
    Send {
        conversation_id: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        reply_to: Option<String>,
    },
    Reply {
        conversation_id: String,
        content: String,
        reply_to_message_id: String,
    },
    SendDirect {
        recipient_id: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
    },
    Edit {
        message_id: String,
        content: String,
    },
    Recall {
        message_id: String,
    },
    DeleteForMe {
        message_id: String,
    },
    Pin {
        conversation_id: String,
        message_id: String,
    },
    Unpin {
        conversation_id: String,
        message_id: String,
    },
    AddReaction {
        message_id: String,
        emoji: String,
    },
    RemoveReaction {
        message_id: String,
    },
    MarkRead {
        conversation_id: String,
        last_message_id: Option<String>,
    },
    UnreadCount {
        conversation_id: String,
    },
    Typing {
        conversation_id: String,
        typing: bool,
    },
    GetMessages {
        conversation_id: String,
        cursor: Option<DateTime<Utc>>,
        limit: Option<u64>,
    },
    AroundMessage {
        conversation_id: String,
        message_id: String,
        before: Option<u64>,
        after: Option<u64>,
    },
    Between {
        conversation_id: String,
        from_message_id: String,
        to_message_id: String,
    },
    Search {
        conversation_id: String,
        keyword: String,
        offset: Option<u64>,
        limit: Option<u64>,
    },
    PinnedMessages {
        conversation_id: String,
    },
    ReconcilePins {
        conversation_id: String,
    },
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::CreateConversation { .. } => "create_conversation",
            ClientAction::ResolveDirect { .. } => "resolve_direct",
            ClientAction::GetConversation { .. } => "get_conversation",
            ClientAction::ListConversations => "list_conversations",
            ClientAction::AddMember { .. } => "add_member",
            ClientAction::RemoveMember { .. } => "remove_member",
            ClientAction::DeleteConversation { .. } => "delete_conversation",
            ClientAction::UpdateGroupInfo { .. } => "update_group_info",
            ClientAction::SetConversationPinned { .. } => "set_conversation_pinned",
            ClientAction::SetMuted { .. } => "set_muted",
            ClientAction::MarkUnread { .. } => "mark_unread",
            ClientAction::Send { .. } => "send",
            ClientAction::Reply { .. } => "reply",
            ClientAction::SendDirect { .. } => "send_direct",
            ClientAction::Edit { .. } => "edit",
            ClientAction::Recall { .. } => "recall",
            ClientAction::DeleteForMe { .. } => "delete_for_me",
            ClientAction::Pin { .. } => "pin",
            ClientAction::Unpin { .. } => "unpin",
            ClientAction::AddReaction { .. } => "add_reaction",
            ClientAction::RemoveReaction { .. } => "remove_reaction",
            ClientAction::MarkRead { .. } => "mark_read",
            ClientAction::UnreadCount { .. } => "unread_count",
            ClientAction::Typing { .. } => "typing",
            ClientAction::GetMessages { .. } => "get_messages",
            ClientAction::AroundMessage { .. } => "around_message",
            ClientAction::Between { .. } => "between",
            ClientAction::Search { .. } => "search",
            ClientAction::PinnedMessages { .. } => "pinned_messages",
            ClientAction::ReconcilePins { .. } => "reconcile_pins",
        }
    }
}

/// 错误详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    pub code: String,
    pub message: String,
}

/// 动作响应信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// 请求中的 `id`（如有）原样回显
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
}

impl ActionResponse {
    pub fn success(id: Option<Value>, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, err: &ChatError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ActionError {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// 解析后的请求：操作者 + 动作
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub id: Option<Value>,
    pub actor: String,
    pub action: ClientAction,
}

impl ActionRequest {
    /// 从 `{"actor": "...", "action": "...", ...}` 解析
    pub fn parse(raw: &str) -> std::result::Result<Self, (Option<Value>, ChatError)> {
        let mut value: Value = serde_json::from_str(raw)
            .map_err(|e| (None, ChatError::invalid_argument(format!("malformed request: {e}"))))?;
        let Some(object) = value.as_object_mut() else {
            return Err((
                None,
                ChatError::invalid_argument("request must be a JSON object"),
            ));
        };

        let id = object.remove("id");
        let actor = match object.remove("actor") {
            Some(Value::String(actor)) if !actor.trim().is_empty() => actor,
            _ => {
                return Err((id, ChatError::invalid_argument("actor is required")));
            }
        };
        if let Err(err) = field_key(&actor, "actor") {
            return Err((id, err));
        }

        let action = serde_json::from_value::<ClientAction>(value)
            .map_err(|e| (id.clone(), ChatError::invalid_argument(e.to_string())))?;

        Ok(Self { id, actor, action })
    }
}

/// 动作分发器：把动作映射到命令 / 查询处理器
pub struct ActionDispatcher {
    commands: Arc<ChatCommandHandler>,
    queries: Arc<ChatQueryHandler>,
}

impl ActionDispatcher {
    pub fn new(commands: Arc<ChatCommandHandler>, queries: Arc<ChatQueryHandler>) -> Self {
        Self { commands, queries }
    }

    /// 处理一行原始 JSON 请求，总是返回响应信封
    pub async fn dispatch_json(&self, raw: &str) -> ActionResponse {
        match ActionRequest::parse(raw) {
            Ok(request) => {
                let result = self.dispatch(&request.actor, request.action).await;
                match result {
                    Ok(data) => ActionResponse::success(request.id, data),
                    Err(err) => ActionResponse::failure(request.id, &err),
                }
            }
            Err((id, err)) => {
                debug!(error = %err, "Rejected malformed action");
                ActionResponse::failure(id, &err)
            }
        }
    }

    /// 以 `actor` 身份执行动作
    pub async fn dispatch(&self, actor: &str, action: ClientAction) -> Result<Value> {
        let name = action.name();
        debug!(actor = %actor, action = name, "Dispatching action");

        let result = self.execute(actor.to_string(), action).await;
        if let Err(err) = &result {
            match err {
                ChatError::Storage(_) => {
                    warn!(actor = %actor, action = name, error = %err, "Action failed")
                }
                _ => debug!(actor = %actor, action = name, error = %err, "Action rejected"),
            }
        }
        result
    }

    async fn execute(&self, actor: String, action: ClientAction) -> Result<Value> {
        match action {
            ClientAction::CreateConversation {
                kind,
                members,
                name,
                description,
                avatar_url,
            } => to_data(
                self.commands
                    .handle_create_conversation(CreateConversationCommand {
                        actor_id: actor,
                        kind,
                        members,
                        name,
                        description,
                        avatar_url,
                    })
                    .await?,
            ),
            ClientAction::ResolveDirect { peer_id } => to_data(
                self.queries
                    .handle_resolve_direct(ResolveDirectQuery {
                        user_id: actor,
                        peer_id,
                    })
                    .await?,
            ),
            ClientAction::GetConversation { conversation_id } => to_data(
                self.queries
                    .handle_get_conversation(GetConversationQuery {
                        conversation_id,
                        user_id: actor,
                    })
                    .await?,
            ),
            ClientAction::ListConversations => to_data(
                self.queries
                    .handle_list_conversations(ListConversationsQuery { user_id: actor })
                    .await?,
            ),
            ClientAction::AddMember {
                conversation_id,
                user_id,
            } => to_data(
                self.commands
                    .handle_add_member(MemberCommand {
                        conversation_id,
                        user_id,
                        actor_id: actor,
                    })
                    .await?,
            ),
            ClientAction::RemoveMember {
                conversation_id,
                user_id,
            } => to_data(
                self.commands
                    .handle_remove_member(MemberCommand {
                        conversation_id,
                        user_id,
                        actor_id: actor,
                    })
                    .await?,
            ),
            ClientAction::DeleteConversation { conversation_id } => {
                self.commands
                    .handle_delete_conversation(DeleteConversationCommand {
                        conversation_id,
                        actor_id: actor,
                    })
                    .await?;
                Ok(Value::Null)
            }
            ClientAction::UpdateGroupInfo {
                conversation_id,
                name,
                description,
                avatar_url,
            } => to_data(
                self.commands
                    .handle_update_group_info(UpdateGroupInfoCommand {
                        conversation_id,
                        actor_id: actor,
                        update: ConversationMetaUpdate {
                            name,
                            description,
                            avatar_url,
                        },
                    })
                    .await?,
            ),
            ClientAction::SetConversationPinned {
                conversation_id,
                pinned,
            } => {
                self.update_preference(conversation_id, actor, PreferenceChange::Pinned(pinned))
                    .await
            }
            ClientAction::SetMuted {
                conversation_id,
                muted,
            } => {
                self.update_preference(conversation_id, actor, PreferenceChange::Muted(muted))
                    .await
            }
            ClientAction::MarkUnread { conversation_id } => {
                self.update_preference(conversation_id, actor, PreferenceChange::MarkUnread)
                    .await
            }
            ClientAction::Send {
                conversation_id,
                content,
                kind,
                reply_to,
            } => to_data(
                self.commands
                    .handle_send_message(SendMessageCommand {
                        conversation_id,
                        sender_id: actor,
                        content,
                        kind,
                        reply_to,
                    })
                    .await?,
            ),
            ClientAction::Reply {
                conversation_id,
                content,
                reply_to_message_id,
            } => to_data(
                self.commands
                    .handle_send_message(SendMessageCommand {
                        conversation_id,
                        sender_id: actor,
                        content,
                        kind: MessageKind::Text,
                        reply_to: Some(reply_to_message_id),
                    })
                    .await?,
            ),
            ClientAction::SendDirect {
                recipient_id,
                content,
                kind,
            } => to_data(
                self.commands
                    .handle_send_direct(SendDirectCommand {
                        sender_id: actor,
                        recipient_id,
                        content,
                        kind,
                    })
                    .await?,
            ),
            ClientAction::Edit {
                message_id,
                content,
            } => to_data(
                self.commands
                    .handle_edit_message(EditMessageCommand {
                        message_id,
                        editor_id: actor,
                        content,
                    })
                    .await?,
            ),
            ClientAction::Recall { message_id } => to_data(
                self.commands
                    .handle_recall(MessageActionCommand {
                        message_id,
                        actor_id: actor,
                    })
                    .await?,
            ),
            ClientAction::DeleteForMe { message_id } => {
                self.commands
                    .handle_delete_for_me(MessageActionCommand {
                        message_id,
                        actor_id: actor,
                    })
                    .await?;
                Ok(Value::Null)
            }
            ClientAction::Pin {
                conversation_id,
                message_id,
            } => to_data(
                self.commands
                    .handle_pin(PinMessageCommand {
                        conversation_id,
                        message_id,
                        actor_id: actor,
                        pinned: true,
                    })
                    .await?,
            ),
            ClientAction::Unpin {
                conversation_id,
                message_id,
            } => to_data(
                self.commands
                    .handle_pin(PinMessageCommand {
                        conversation_id,
                        message_id,
                        actor_id: actor,
                        pinned: false,
                    })
                    .await?,
            ),
            ClientAction::AddReaction { message_id, emoji } => to_data(
                self.commands
                    .handle_add_reaction(AddReactionCommand {
                        message_id,
                        user_id: actor,
                        emoji,
                    })
                    .await?,
            ),
            ClientAction::RemoveReaction { message_id } => to_data(
                self.commands
                    .handle_remove_reaction(MessageActionCommand {
                        message_id,
                        actor_id: actor,
                    })
                    .await?,
            ),
            ClientAction::MarkRead {
                conversation_id,
                last_message_id,
            } => {
                let marked = self
                    .commands
                    .handle_mark_read(MarkReadCommand {
                        conversation_id,
                        user_id: actor,
                        last_message_id,
                    })
                    .await?;
                Ok(serde_json::json!({ "marked": marked }))
            }
            ClientAction::UnreadCount { conversation_id } => {
                let unread = self
                    .queries
                    .handle_unread_count(ConversationScopedQuery {
                        conversation_id,
                        user_id: actor,
                    })
                    .await?;
                Ok(serde_json::json!({ "unread_count": unread }))
            }
            ClientAction::Typing {
                conversation_id,
                typing,
            } => {
                self.commands
                    .handle_typing(TypingCommand {
                        conversation_id,
                        user_id: actor,
                        typing,
                    })
                    .await?;
                Ok(Value::Null)
            }
            ClientAction::GetMessages {
                conversation_id,
                cursor,
                limit,
            } => to_data(
                self.queries
                    .handle_get_messages(GetMessagesQuery {
                        conversation_id,
                        user_id: actor,
                        cursor,
                        limit,
                    })
                    .await?,
            ),
            ClientAction::AroundMessage {
                conversation_id,
                message_id,
                before,
                after,
            } => to_data(
                self.queries
                    .handle_around_message(AroundMessageQuery {
                        conversation_id,
                        user_id: actor,
                        message_id,
                        before,
                        after,
                    })
                    .await?,
            ),
            ClientAction::Between {
                conversation_id,
                from_message_id,
                to_message_id,
            } => to_data(
                self.queries
                    .handle_between(BetweenMessagesQuery {
                        conversation_id,
                        user_id: actor,
                        from_message_id,
                        to_message_id,
                    })
                    .await?,
            ),
            ClientAction::Search {
                conversation_id,
                keyword,
                offset,
                limit,
            } => to_data(
                self.queries
                    .handle_search(SearchMessagesQuery {
                        conversation_id,
                        user_id: actor,
                        keyword,
                        offset,
                        limit,
                    })
                    .await?,
            ),
            ClientAction::PinnedMessages { conversation_id } => to_data(
                self.queries
                    .handle_pinned_messages(ConversationScopedQuery {
                        conversation_id,
                        user_id: actor,
                    })
                    .await?,
            ),
            ClientAction::ReconcilePins { conversation_id } => {
                // 仅成员可触发重建
                self.queries
                    .handle_get_conversation(GetConversationQuery {
                        conversation_id: conversation_id.clone(),
                        user_id: actor,
                    })
                    .await?;
                let ids = self.commands.handle_reconcile_pins(&conversation_id).await?;
                Ok(serde_json::json!({ "pinned_message_ids": ids }))
            }
        }
    }

    async fn update_preference(
        &self,
        conversation_id: String,
        user_id: String,
        change: PreferenceChange,
    ) -> Result<Value> {
        self.commands
            .handle_update_preference(UpdatePreferenceCommand {
                conversation_id,
                user_id,
                change,
            })
            .await?;
        Ok(Value::Null)
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ChatError::Storage(e.into()))
}
