//! Outbox 分发器
//!
//! 后台轮询未投递的 outbox 记录并重试投递。记录先被认领（租约）再投递，
//! 即时投递持有租约的记录不会被重复投递。超过最大尝试次数的记录不再重试，
//! 保留到保留期结束后与已投递记录一并清理。投递语义为至少一次。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::repository::{EventPublisher, OutboxRepository};
use crate::metrics::CHAT_METRICS;

#[derive(Debug, Clone)]
pub struct OutboxDispatcherSettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_attempts: u32,
    /// 认领记录的租约时长，到期未标记的记录可被重新认领
    pub claim_lease: Duration,
    /// 已投递与已耗尽记录的保留时长
    pub retention: Duration,
}

impl Default for OutboxDispatcherSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
            claim_lease: Duration::from_secs(30),
            retention: Duration::from_secs(3600),
        }
    }
}

pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn EventPublisher>,
    settings: OutboxDispatcherSettings,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn EventPublisher>,
        settings: OutboxDispatcherSettings,
    ) -> Self {
        Self {
            outbox,
            publisher,
            settings,
        }
    }

    /// 处理一批待投递记录，返回成功投递条数
    pub async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.settings.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let records = self
            .outbox
            .claim(
                self.settings.batch_size,
                self.settings.max_attempts,
                now,
                now + lease,
            )
            .await?;

        let mut delivered = 0usize;
        for record in records {
            let channel = record.destination.channel_kind();
            match self
                .publisher
                .publish(&record.destination, &record.envelope)
                .await
            {
                Ok(()) => {
                    CHAT_METRICS.record_delivery(channel, true);
                    if let Err(err) = self.outbox.mark_delivered(record.id, Utc::now()).await {
                        // 已投递但标记失败，下一轮可能重复投递
                        error!(record_id = %record.id, error = %err, "Failed to mark outbox record delivered");
                    } else {
                        delivered += 1;
                    }
                }
                Err(err) => {
                    CHAT_METRICS.record_delivery(channel, false);
                    warn!(
                        record_id = %record.id,
                        event = record.envelope.event.kind(),
                        attempts = record.attempts + 1,
                        max_attempts = self.settings.max_attempts,
                        error = %err,
                        "Outbox delivery failed"
                    );
                    if let Err(mark_err) = self.outbox.mark_failed(record.id, &err.to_string()).await {
                        error!(record_id = %record.id, error = %mark_err, "Failed to mark outbox record failed");
                    }
                }
            }
        }

        if let Ok(pending) = self.outbox.pending_count().await {
            CHAT_METRICS.outbox_pending.set(pending as i64);
        }

        Ok(delivered)
    }

    /// 清理超过保留期的已投递与已耗尽记录
    pub async fn purge(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        self.outbox
            .purge(Utc::now() - retention, self.settings.max_attempts)
            .await
    }

    /// 轮询循环，直到 `shutdown` 变为 true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            batch_size = self.settings.batch_size,
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            max_attempts = self.settings.max_attempts,
            "Outbox dispatcher starting"
        );

        loop {
            match self.run_once().await {
                Ok(0) => debug!("No outbox records to deliver"),
                Ok(count) => info!(delivered = count, "Delivered outbox records"),
                Err(err) => error!(error = %err, "Outbox dispatcher error"),
            }

            if let Err(err) = self.purge().await {
                warn!(error = %err, "Failed to purge outbox records");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Outbox dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }
}
