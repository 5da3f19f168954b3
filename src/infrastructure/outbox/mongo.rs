//! MongoDB outbox，与聊天数据同库

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{self, Document, doc};
use mongodb::options::{FindOneAndUpdateOptions, IndexOptions, ReturnDocument};
use mongodb::{Collection, Database, IndexModel};
use uuid::Uuid;

use crate::domain::repository::{OutboxRecord, OutboxRepository};

pub struct MongoOutbox {
    collection: Collection<Document>,
}

impl MongoOutbox {
    pub async fn new(database: &Database, collection: &str) -> Result<Self> {
        let collection = database.collection::<Document>(collection);

        let pending_index = IndexModel::builder()
            .keys(doc! { "delivered": 1, "created_at_us": 1 })
            .options(
                IndexOptions::builder()
                    .name(Some("idx_outbox_pending".to_string()))
                    .build(),
            )
            .build();
        collection.create_index(pending_index, None).await?;

        Ok(Self { collection })
    }

    fn record_document(record: &OutboxRecord) -> Result<Document> {
        let mut document = bson::to_document(record)?;
        document.insert("_id", record.id.to_string());
        document.insert("delivered", record.delivered_at.is_some());
        document.insert("created_at_us", record.created_at.timestamp_micros());
        document.insert(
            "claimed_until_us",
            record.claimed_until.map(|at| at.timestamp_micros()),
        );
        Ok(document)
    }
}

#[async_trait]
impl OutboxRepository for MongoOutbox {
    async fn enqueue(&self, records: &[OutboxRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let documents = records
            .iter()
            .map(Self::record_document)
            .collect::<Result<Vec<_>>>()?;
        self.collection.insert_many(documents, None).await?;
        Ok(())
    }

    async fn claim(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>> {
        // 逐条 find_one_and_update，同一记录只会被一个投递者认领
        let filter = doc! {
            "delivered": false,
            "attempts": { "$lt": max_attempts as i64 },
            "$or": [
                { "claimed_until_us": null },
                { "claimed_until_us": { "$lte": now.timestamp_micros() } },
            ],
        };
        let update = doc! {
            "$set": {
                "claimed_until": bson::to_bson(&lease_until)?,
                "claimed_until_us": lease_until.timestamp_micros(),
            }
        };

        let mut claimed = Vec::new();
        while claimed.len() < limit {
            let options = FindOneAndUpdateOptions::builder()
                .sort(doc! { "created_at_us": 1 })
                .return_document(ReturnDocument::After)
                .build();
            let Some(document) = self
                .collection
                .find_one_and_update(filter.clone(), update.clone(), options)
                .await?
            else {
                break;
            };
            claimed.push(bson::from_document(document)?);
        }
        Ok(claimed)
    }

    async fn mark_delivered(&self, record_id: Uuid, delivered_at: DateTime<Utc>) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": record_id.to_string() },
                doc! {
                    "$set": {
                        "delivered": true,
                        "delivered_at": bson::to_bson(&delivered_at)?,
                        "delivered_at_us": delivered_at.timestamp_micros(),
                    }
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, record_id: Uuid, error: &str) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": record_id.to_string() },
                doc! {
                    "$inc": { "attempts": 1 },
                    "$set": {
                        "last_error": error,
                        "claimed_until": null,
                        "claimed_until_us": null,
                    }
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self
            .collection
            .count_documents(doc! { "delivered": false }, None)
            .await?)
    }

    async fn purge(&self, before: DateTime<Utc>, max_attempts: u32) -> Result<u64> {
        let cutoff = before.timestamp_micros();
        let result = self
            .collection
            .delete_many(
                doc! {
                    "$or": [
                        { "delivered": true, "delivered_at_us": { "$lt": cutoff } },
                        {
                            "delivered": false,
                            "attempts": { "$gte": max_attempts as i64 },
                            "created_at_us": { "$lt": cutoff },
                        },
                    ]
                },
                None,
            )
            .await?;
        Ok(result.deleted_count)
    }
}
