//! Redis PUBLISH 实时投递
//!
//! 频道名与内存 hub 一致，载荷为 JSON 序列化的 [`EventEnvelope`]。

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use tracing::{debug, info};

use crate::domain::model::{Destination, EventEnvelope};
use crate::domain::repository::EventPublisher;

pub struct RedisRealtimePublisher {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisRealtimePublisher {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid realtime.redis_url")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!(redis_url = %redis_url, "Redis realtime publisher connected");
        Ok(Self {
            connection,
            prefix: prefix.into(),
        })
    }
}

#[async_trait]
impl EventPublisher for RedisRealtimePublisher {
    async fn publish(&self, destination: &Destination, envelope: &EventEnvelope) -> Result<()> {
        let channel = destination.channel_name(&self.prefix);
        let payload = serde_json::to_string(envelope)?;
        let mut connection = self.connection.clone();
        let receivers: i64 = connection.publish(&channel, payload).await?;
        debug!(channel = %channel, receivers = receivers, event = envelope.event.kind(), "Event published to Redis");
        Ok(())
    }
}
