//! 内存版 outbox

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::repository::{OutboxRecord, OutboxRepository};

/// 按入队顺序保存记录，并按 ID 索引
#[derive(Default)]
struct OutboxState {
    next_seq: u64,
    records: BTreeMap<u64, OutboxRecord>,
    index: HashMap<Uuid, u64>,
}

impl OutboxState {
    fn get_mut(&mut self, record_id: Uuid) -> Option<&mut OutboxRecord> {
        let seq = self.index.get(&record_id)?;
        self.records.get_mut(seq)
    }
}

#[derive(Default)]
pub struct InMemoryOutbox {
    state: RwLock<OutboxState>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutbox {
    async fn enqueue(&self, records: &[OutboxRecord]) -> Result<()> {
        let mut state = self.state.write().await;
        for record in records {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.index.insert(record.id, seq);
            state.records.insert(seq, record.clone());
        }
        Ok(())
    }

    async fn claim(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        let mut state = self.state.write().await;
        Ok(state
            .records
            .values_mut()
            .filter(|r| r.delivered_at.is_none() && r.attempts < max_attempts && !r.is_claimed(now))
            .take(limit)
            .map(|r| {
                r.claimed_until = Some(lease_until);
                r.clone()
            })
            .collect())
    }

    async fn mark_delivered(&self, record_id: Uuid, delivered_at: DateTime<Utc>) -> Result<()> {
        if let Some(record) = self.state.write().await.get_mut(record_id) {
            record.delivered_at = Some(delivered_at);
        }
        Ok(())
    }

    async fn mark_failed(&self, record_id: Uuid, error: &str) -> Result<()> {
        if let Some(record) = self.state.write().await.get_mut(record_id) {
            record.attempts += 1;
            record.last_error = Some(error.to_string());
            record.claimed_until = None;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.delivered_at.is_none())
            .count() as u64)
    }

    async fn purge(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64> {
        let mut state = self.state.write().await;
        let expired: Vec<(u64, Uuid)> = state
            .records
            .iter()
            .filter(|(_, r)| match r.delivered_at {
                Some(at) => at < before,
                None => r.attempts >= max_attempts && r.created_at < before,
            })
            .map(|(seq, r)| (*seq, r.id))
            .collect();
        for (seq, id) in &expired {
            state.records.remove(seq);
            state.index.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
