pub mod delivery;
pub mod derived_state;
pub mod directory;
pub mod fanout;
pub mod outbox_dispatcher;
pub mod pipeline;
pub mod query;
pub mod read_tracking;
pub mod visibility;

pub use delivery::MessageDelivery;
pub use derived_state::DerivedStateCalculator;
pub use directory::{ConversationDirectoryService, NewConversation};
pub use fanout::{FanoutService, FanoutSettings};
pub use outbox_dispatcher::{OutboxDispatcher, OutboxDispatcherSettings};
pub use pipeline::{MessagePipelineService, OutgoingMessage};
pub use query::{MessageQueryService, QuerySettings};
pub use read_tracking::ReadTrackingService;
pub use visibility::{Visibility, VisibilityMode, VisibilityResolver};

use crate::domain::model::{Conversation, Message};
use crate::domain::repository::{ConversationRepository, MessageRepository};
use crate::error::{ChatError, Result};

pub(crate) async fn load_conversation(
    repo: &dyn ConversationRepository,
    conversation_id: &str,
) -> Result<Conversation> {
    repo.find_by_id(conversation_id)
        .await?
        .ok_or_else(|| ChatError::not_found(format!("conversation {conversation_id}")))
}

/// 加载会话并校验成员身份
pub(crate) async fn load_for_member(
    repo: &dyn ConversationRepository,
    conversation_id: &str,
    user_id: &str,
) -> Result<Conversation> {
    let conversation = load_conversation(repo, conversation_id).await?;
    if !conversation.is_member(user_id) {
        return Err(ChatError::permission_denied(format!(
            "user {user_id} is not a member of conversation {conversation_id}"
        )));
    }
    Ok(conversation)
}

pub(crate) async fn load_message(repo: &dyn MessageRepository, message_id: &str) -> Result<Message> {
    repo.find_by_id(message_id)
        .await?
        .ok_or_else(|| ChatError::not_found(format!("message {message_id}")))
}

/// 加载消息并校验其属于指定会话
pub(crate) async fn load_message_in(
    repo: &dyn MessageRepository,
    conversation_id: &str,
    message_id: &str,
) -> Result<Message> {
    let message = load_message(repo, message_id).await?;
    if message.conversation_id != conversation_id {
        return Err(ChatError::not_found(format!(
            "message {message_id} in conversation {conversation_id}"
        )));
    }
    Ok(message)
}

fn non_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ChatError::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

/// 会作为文档字段名存储的值（回应 emoji、已读指针的用户ID）
///
/// 不允许包含 `.` 或以 `$` 开头，否则会被存储层解释为嵌套路径或操作符。
pub fn field_key(value: &str, field: &str) -> Result<()> {
    non_empty(value, field)?;
    if value.contains('.') || value.starts_with('$') {
        return Err(ChatError::invalid_argument(format!(
            "{field} must not contain '.' or start with '$'"
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support;
