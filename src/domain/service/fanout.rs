//! 广播 / 扇出服务
//!
//! 每个变更在持久化成功之后调用本服务：
//! - 会话主题发布一次（所有订阅者）
//! - 每个成员的个人主题各发布一次，消息类事件附带该接收者的实时未读数
//! - DIRECT 消息额外投递到每个成员的点对点队列
//!
//! 投递先写入 outbox，再按配置尝试即时投递；任何投递失败只记录日志，
//! 绝不回滚也不使原请求失败，未投递记录由 outbox 分发器重试。
//! 即时投递的记录入队时即持有租约，分发器在租约期内不会认领它们。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::domain::model::{ChatEvent, Conversation, Destination, EventEnvelope};
use crate::domain::repository::{EventPublisher, OutboxRecord, OutboxRepository};
use crate::domain::service::derived_state::DerivedStateCalculator;
use crate::metrics::CHAT_METRICS;

#[derive(Debug, Clone, Copy)]
pub struct FanoutSettings {
    /// 写入 outbox 后立即尝试投递
    pub dispatch_inline: bool,
    /// 即时投递持有的租约时长
    pub claim_lease: Duration,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            dispatch_inline: true,
            claim_lease: Duration::from_secs(30),
        }
    }
}

pub struct FanoutService {
    outbox: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn EventPublisher>,
    derived: DerivedStateCalculator,
    settings: FanoutSettings,
}

impl FanoutService {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn EventPublisher>,
        derived: DerivedStateCalculator,
        settings: FanoutSettings,
    ) -> Self {
        Self {
            outbox,
            publisher,
            derived,
            settings,
        }
    }

    /// 会话主题 + 每个成员的个人主题
    pub async fn broadcast(&self, event: ChatEvent, conversation: &Conversation) {
        self.broadcast_to(event, &conversation.id, &conversation.members)
            .await;
    }

    /// 会话主题 + 指定接收者的个人主题（用于成员变更前后的成员集合）
    pub async fn broadcast_to(&self, event: ChatEvent, conversation_id: &str, recipients: &[String]) {
        let mut deliveries = vec![(
            Destination::ConversationTopic(conversation_id.to_string()),
            EventEnvelope::for_topic(event.clone(), conversation_id),
        )];
        deliveries.extend(
            self.personal_deliveries(&event, conversation_id, recipients, Destination::UserTopic)
                .await,
        );
        self.submit(deliveries).await;
    }

    /// 仅个人主题
    pub async fn notify_members(&self, event: ChatEvent, conversation_id: &str, members: &[String]) {
        let deliveries = self
            .personal_deliveries(&event, conversation_id, members, Destination::UserTopic)
            .await;
        self.submit(deliveries).await;
    }

    /// 仅单个用户的个人主题（例如对自己删除）
    pub async fn notify_user(&self, event: ChatEvent, conversation_id: &str, user_id: &str) {
        self.notify_members(event, conversation_id, &[user_id.to_string()])
            .await;
    }

    /// DIRECT 会话的冗余点对点投递
    pub async fn deliver_direct_queues(&self, event: ChatEvent, conversation: &Conversation) {
        if !conversation.is_direct() {
            return;
        }
        let deliveries = self
            .personal_deliveries(
                &event,
                &conversation.id,
                &conversation.members,
                Destination::UserQueue,
            )
            .await;
        self.submit(deliveries).await;
    }

    /// 仅会话主题（例如输入状态）
    pub async fn publish_topic(&self, event: ChatEvent, conversation_id: &str) {
        self.submit(vec![(
            Destination::ConversationTopic(conversation_id.to_string()),
            EventEnvelope::for_topic(event, conversation_id),
        )])
        .await;
    }

    async fn personal_deliveries(
        &self,
        event: &ChatEvent,
        conversation_id: &str,
        recipients: &[String],
        destination: fn(String) -> Destination,
    ) -> Vec<(Destination, EventEnvelope)> {
        let mut deliveries = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let unread_count = if event.carries_unread_count() {
                match self.derived.unread_count(conversation_id, recipient).await {
                    Ok(count) => Some(count),
                    Err(err) => {
                        warn!(
                            conversation_id = %conversation_id,
                            user_id = %recipient,
                            error = %err,
                            "Failed to compute unread count for fan-out, sending without it"
                        );
                        None
                    }
                }
            } else {
                None
            };

            deliveries.push((
                destination(recipient.clone()),
                EventEnvelope::for_recipient(
                    event.clone(),
                    conversation_id,
                    recipient,
                    unread_count,
                ),
            ));
        }
        deliveries
    }

    async fn submit(&self, deliveries: Vec<(Destination, EventEnvelope)>) {
        if deliveries.is_empty() {
            return;
        }

        let lease_until = Utc::now()
            + chrono::Duration::from_std(self.settings.claim_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let records: Vec<OutboxRecord> = deliveries
            .into_iter()
            .map(|(destination, envelope)| {
                if self.settings.dispatch_inline {
                    OutboxRecord::claimed(destination, envelope, lease_until)
                } else {
                    OutboxRecord::new(destination, envelope)
                }
            })
            .collect();

        if let Err(err) = self.outbox.enqueue(&records).await {
            // outbox 不可用时退化为一次性尽力投递
            error!(error = %err, count = records.len(), "Failed to enqueue outbox records");
            for record in &records {
                self.publish_once(record).await;
            }
            return;
        }

        if !self.settings.dispatch_inline {
            return;
        }

        for record in &records {
            if self.publish_once(record).await {
                if let Err(err) = self.outbox.mark_delivered(record.id, Utc::now()).await {
                    warn!(record_id = %record.id, error = %err, "Failed to mark outbox record delivered");
                }
            } else if let Err(err) = self
                .outbox
                .mark_failed(record.id, "inline delivery failed")
                .await
            {
                warn!(record_id = %record.id, error = %err, "Failed to mark outbox record failed");
            }
        }
    }

    async fn publish_once(&self, record: &OutboxRecord) -> bool {
        let channel = record.destination.channel_kind();
        match self
            .publisher
            .publish(&record.destination, &record.envelope)
            .await
        {
            Ok(()) => {
                debug!(
                    event = record.envelope.event.kind(),
                    destination = ?record.destination,
                    "Event delivered"
                );
                CHAT_METRICS.record_delivery(channel, true);
                true
            }
            Err(err) => {
                warn!(
                    event = record.envelope.event.kind(),
                    destination = ?record.destination,
                    error = %err,
                    "Event delivery failed"
                );
                CHAT_METRICS.record_delivery(channel, false);
                false
            }
        }
    }
}
