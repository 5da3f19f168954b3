//! 进程内实时分发（tokio broadcast）
//!
//! 每个频道一个 broadcast 通道，订阅时按需创建。没有订阅者的频道直接丢弃事件，
//! 慢订阅者落后超过容量时丢失最旧事件，不会阻塞发布方。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

use crate::domain::model::{Destination, EventEnvelope};
use crate::domain::repository::EventPublisher;

pub struct LocalRealtimeHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<EventEnvelope>>>>,
    prefix: String,
    capacity: usize,
}

impl LocalRealtimeHub {
    pub fn new(prefix: impl Into<String>, capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            prefix: prefix.into(),
            capacity: capacity.max(1),
        }
    }

    pub async fn subscribe(&self, destination: &Destination) -> broadcast::Receiver<EventEnvelope> {
        let channel = destination.channel_name(&self.prefix);
        let mut channels = self.channels.write().await;
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// 当前存在订阅者的频道数
    pub async fn active_channels(&self) -> usize {
        self.channels
            .read()
            .await
            .values()
            .filter(|sender| sender.receiver_count() > 0)
            .count()
    }
}

#[async_trait]
impl EventPublisher for LocalRealtimeHub {
    async fn publish(&self, destination: &Destination, envelope: &EventEnvelope) -> Result<()> {
        let channel = destination.channel_name(&self.prefix);
        let channels = self.channels.read().await;
        match channels.get(&channel) {
            Some(sender) => {
                // 没有存活订阅者时 send 返回错误，视为无人收听
                let receivers = sender.send(envelope.clone()).unwrap_or(0);
                trace!(channel = %channel, receivers = receivers, "Event published");
            }
            None => trace!(channel = %channel, "No subscribers, event dropped"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::ChatEvent;

    fn typing_envelope() -> EventEnvelope {
        EventEnvelope::for_topic(
            ChatEvent::Typing {
                conversation_id: "c1".into(),
                user_id: "alice".into(),
                typing: true,
            },
            "c1",
        )
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let hub = LocalRealtimeHub::new("flare:chat", 16);
        let topic = Destination::ConversationTopic("c1".into());
        let mut receiver = hub.subscribe(&topic).await;

        hub.publish(&topic, &typing_envelope()).await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event.kind(), "typing");
        assert_eq!(hub.active_channels().await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let hub = LocalRealtimeHub::new("flare:chat", 16);
        let topic = Destination::UserTopic("nobody".into());
        assert!(hub.publish(&topic, &typing_envelope()).await.is_ok());

        let receiver = hub.subscribe(&topic).await;
        drop(receiver);
        assert!(hub.publish(&topic, &typing_envelope()).await.is_ok());
    }
}
