//! 消息落库与投递
//!
//! 普通消息与系统日志共用的写路径：持久化 -> 更新会话活跃时间 -> 广播。

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::model::{ChatEvent, Conversation, Message, MessageKind, MessageView};
use crate::domain::repository::{ConversationRepository, MessageRepository};
use crate::domain::service::fanout::FanoutService;
use crate::error::Result;

pub struct MessageDelivery {
    conversation_repo: Arc<dyn ConversationRepository>,
    message_repo: Arc<dyn MessageRepository>,
    fanout: Arc<FanoutService>,
}

impl MessageDelivery {
    pub fn new(
        conversation_repo: Arc<dyn ConversationRepository>,
        message_repo: Arc<dyn MessageRepository>,
        fanout: Arc<FanoutService>,
    ) -> Self {
        Self {
            conversation_repo,
            message_repo,
            fanout,
        }
    }

    /// 持久化并广播
    ///
    /// GROUP 会话广播到会话主题与成员个人主题；DIRECT 会话额外投递到
    /// 每个成员的点对点队列。
    pub async fn deliver(&self, conversation: &Conversation, message: Message) -> Result<Message> {
        self.message_repo.insert(&message).await?;

        // 活跃时间只影响排序，失败不影响消息本身
        if let Err(err) = self
            .conversation_repo
            .touch(&conversation.id, message.sent_at)
            .await
        {
            warn!(conversation_id = %conversation.id, error = %err, "Failed to touch conversation");
        }

        debug!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            kind = message.kind.as_str(),
            "Message persisted"
        );

        let event = ChatEvent::Message {
            message: MessageView::plain(&message),
        };
        self.fanout.broadcast(event.clone(), conversation).await;
        if conversation.is_direct() {
            self.fanout.deliver_direct_queues(event, conversation).await;
        }

        Ok(message)
    }

    /// 写入一条 SYSTEM_LOG 消息，发送者记为操作者
    pub async fn system_log(
        &self,
        conversation: &Conversation,
        actor_id: &str,
        content: impl Into<String>,
    ) -> Result<Message> {
        let message = Message::compose(
            &conversation.id,
            actor_id,
            content,
            MessageKind::SystemLog,
            Utc::now(),
        );
        self.deliver(conversation, message).await
    }
}
