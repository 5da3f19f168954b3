//! MongoDB 存储实现
//!
//! 文档即领域模型的 serde 序列化，外加用于范围查询与排序的微秒时间戳字段
//! (`sent_at_us` / `updated_at_us`)。DIRECT 会话额外写入 `direct_key`，
//! 由唯一索引保证成员对唯一。

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, Bson, Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::info;

use crate::config::StoreConfig;
use crate::domain::model::{
    Conversation, ConversationMetaUpdate, ConversationPreference, EditRecord, Message,
};
use crate::domain::repository::{
    ConversationRepository, MessageFilter, MessageRepository, PinMark, SortOrder,
};

const DUPLICATE_KEY: i32 = 11000;

pub struct MongoChatStore {
    conversations: Collection<Document>,
    messages: Collection<Document>,
    database: Database,
}

impl MongoChatStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let uri = config
            .mongo_url
            .as_deref()
            .context("store.mongo_url is required for the mongo backend")?;

        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;
        let database = client.database(&config.mongo_database);
        let conversations = database.collection::<Document>(&config.conversations_collection);
        let messages = database.collection::<Document>(&config.messages_collection);

        ensure_indexes(&conversations, &messages).await?;
        info!(
            database = %config.mongo_database,
            conversations = %config.conversations_collection,
            messages = %config.messages_collection,
            "MongoDB chat store ready"
        );

        Ok(Self {
            conversations,
            messages,
            database,
        })
    }

    /// 同库的其它集合（outbox）共用该连接
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn direct_key(user_a: &str, user_b: &str) -> String {
        if user_a <= user_b {
            format!("{user_a}|{user_b}")
        } else {
            format!("{user_b}|{user_a}")
        }
    }

    fn conversation_document(conversation: &Conversation) -> Result<Document> {
        let mut document = bson::to_document(conversation)?;
        document.insert("_id", conversation.id.clone());
        document.insert("updated_at_us", conversation.updated_at.timestamp_micros());
        if let [a, b] = conversation.members.as_slice() {
            if conversation.is_direct() {
                document.insert("direct_key", Self::direct_key(a, b));
            }
        }
        Ok(document)
    }

    fn message_document(message: &Message) -> Result<Document> {
        let mut document = bson::to_document(message)?;
        document.insert("_id", message.id.clone());
        document.insert("sent_at_us", message.sent_at.timestamp_micros());
        Ok(document)
    }

    fn message_query(filter: &MessageFilter) -> Document {
        let mut query = doc! { "conversation_id": &filter.conversation_id };

        let mut range = Document::new();
        if let Some(before) = filter.sent_before {
            range.insert("$lt", before.timestamp_micros());
        }
        if let Some(after) = filter.sent_after {
            range.insert("$gt", after.timestamp_micros());
        }
        if !range.is_empty() {
            query.insert("sent_at_us", range);
        }

        if filter.exclude_recalled {
            query.insert("recalled", false);
        }
        if let Some(user_id) = &filter.hidden_for {
            query.insert("deleted_for_users", doc! { "$ne": user_id });
        }
        if let Some(user_id) = &filter.unread_by {
            query.insert("sender_id", doc! { "$ne": user_id });
            query.insert("read_by", doc! { "$ne": user_id });
        }
        if filter.pinned_only {
            query.insert("pinned", true);
        }
        if let Some(keyword) = &filter.content_contains {
            query.insert(
                "content",
                doc! { "$regex": escape_regex(keyword), "$options": "i" },
            );
        }
        query
    }

    async fn update_conversation(&self, conversation_id: &str, update: Document) -> Result<bool> {
        let result = self
            .conversations
            .update_one(doc! { "_id": conversation_id }, update, None)
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn update_message(&self, filter: Document, update: Document) -> Result<bool> {
        let result = self.messages.update_one(filter, update, None).await?;
        Ok(result.modified_count > 0)
    }
}

async fn ensure_indexes(
    conversations: &Collection<Document>,
    messages: &Collection<Document>,
) -> Result<()> {
    let members_index = IndexModel::builder()
        .keys(doc! { "members": 1, "updated_at_us": -1 })
        .options(
            IndexOptions::builder()
                .name(Some("idx_members_updated".to_string()))
                .build(),
        )
        .build();
    conversations.create_index(members_index, None).await?;

    let direct_index = IndexModel::builder()
        .keys(doc! { "direct_key": 1 })
        .options(
            IndexOptions::builder()
                .unique(true)
                .partial_filter_expression(doc! { "direct_key": { "$exists": true } })
                .name(Some("uid_direct_pair".to_string()))
                .build(),
        )
        .build();
    conversations.create_index(direct_index, None).await?;

    let timeline_index = IndexModel::builder()
        .keys(doc! { "conversation_id": 1, "sent_at_us": -1, "_id": -1 })
        .options(
            IndexOptions::builder()
                .name(Some("idx_conversation_timeline".to_string()))
                .build(),
        )
        .build();
    messages.create_index(timeline_index, None).await?;

    Ok(())
}

/// 转义正则元字符，使关键字按字面匹配
fn escape_regex(keyword: &str) -> String {
    let mut escaped = String::with_capacity(keyword.len());
    for ch in keyword.chars() {
        if "\\^$.|?*+()[]{}".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

fn to_bson<T: serde::Serialize>(value: &T) -> Result<Bson> {
    Ok(bson::to_bson(value)?)
}

#[async_trait]
impl ConversationRepository for MongoChatStore {
    async fn insert(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .insert_one(Self::conversation_document(conversation)?, None)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let document = self
            .conversations
            .find_one(doc! { "_id": conversation_id }, None)
            .await?;
        Ok(document.map(bson::from_document).transpose()?)
    }

    async fn find_direct(&self, user_a: &str, user_b: &str) -> Result<Option<Conversation>> {
        let document = self
            .conversations
            .find_one(doc! { "direct_key": Self::direct_key(user_a, user_b) }, None)
            .await?;
        Ok(document.map(bson::from_document).transpose()?)
    }

    async fn insert_direct_if_absent(&self, conversation: &Conversation) -> Result<Conversation> {
        let (a, b) = match conversation.members.as_slice() {
            [a, b] => (a.clone(), b.clone()),
            _ => anyhow::bail!("direct conversation must have exactly two members"),
        };

        match self
            .conversations
            .insert_one(Self::conversation_document(conversation)?, None)
            .await
        {
            Ok(_) => Ok(conversation.clone()),
            Err(err) if is_duplicate_key(&err) => self
                .find_direct(&a, &b)
                .await?
                .context("direct conversation vanished after duplicate key"),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_for_member(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let options = FindOptions::builder()
            .sort(doc! { "updated_at_us": -1 })
            .build();
        let cursor = self
            .conversations
            .find(doc! { "members": user_id }, options)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        documents
            .into_iter()
            .map(|d| bson::from_document(d).map_err(Into::into))
            .collect()
    }

    async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.update_conversation(conversation_id, doc! { "$addToSet": { "members": user_id } })
            .await
    }

    async fn remove_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.update_conversation(conversation_id, doc! { "$pull": { "members": user_id } })
            .await
    }

    async fn add_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.update_conversation(
            conversation_id,
            doc! { "$addToSet": { "pinned_message_ids": message_id } },
        )
        .await?;
        Ok(())
    }

    async fn remove_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        self.update_conversation(
            conversation_id,
            doc! { "$pull": { "pinned_message_ids": message_id } },
        )
        .await?;
        Ok(())
    }

    async fn replace_pinned_messages(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<()> {
        self.update_conversation(
            conversation_id,
            doc! { "$set": { "pinned_message_ids": message_ids.to_vec() } },
        )
        .await?;
        Ok(())
    }

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let field = format!("last_read_message_id.{user_id}");
        self.update_conversation(conversation_id, doc! { "$set": { field: message_id } })
            .await?;
        Ok(())
    }

    async fn set_preference(
        &self,
        conversation_id: &str,
        user_id: &str,
        preference: ConversationPreference,
        enabled: bool,
    ) -> Result<()> {
        let field = match preference {
            ConversationPreference::Pinned => "pinned_by_users",
            ConversationPreference::Muted => "muted_by_users",
            ConversationPreference::ManuallyUnread => "manually_marked_unread",
        };
        let update = if enabled {
            doc! { "$addToSet": { field: user_id } }
        } else {
            doc! { "$pull": { field: user_id } }
        };
        self.update_conversation(conversation_id, update).await?;
        Ok(())
    }

    async fn update_meta(
        &self,
        conversation_id: &str,
        update: &ConversationMetaUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut set = Document::new();
        if let Some(name) = &update.name {
            set.insert("name", name.clone());
        }
        if let Some(description) = &update.description {
            set.insert("description", description.clone());
        }
        if let Some(avatar_url) = &update.avatar_url {
            set.insert("avatar_url", avatar_url.clone());
        }
        if set.is_empty() {
            return Ok(());
        }
        self.update_conversation(conversation_id, doc! { "$set": set })
            .await?;
        self.touch(conversation_id, updated_at).await
    }

    async fn touch(&self, conversation_id: &str, updated_at: DateTime<Utc>) -> Result<()> {
        // 只前进不后退
        self.conversations
            .update_one(
                doc! {
                    "_id": conversation_id,
                    "updated_at_us": { "$lt": updated_at.timestamp_micros() },
                },
                doc! {
                    "$set": {
                        "updated_at": to_bson(&updated_at)?,
                        "updated_at_us": updated_at.timestamp_micros(),
                    }
                },
                None,
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        let result = self
            .conversations
            .delete_one(doc! { "_id": conversation_id }, None)
            .await?;
        Ok(result.deleted_count > 0)
    }
}

#[async_trait]
impl MessageRepository for MongoChatStore {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.messages
            .insert_one(Self::message_document(message)?, None)
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<Message>> {
        let document = self
            .messages
            .find_one(doc! { "_id": message_id }, None)
            .await?;
        Ok(document.map(bson::from_document).transpose()?)
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let direction = match filter.order {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        let options = FindOptions::builder()
            .sort(doc! { "sent_at_us": direction, "_id": direction })
            .skip(Some(filter.offset))
            .limit(filter.limit.map(|l| l as i64))
            .build();

        let cursor = self
            .messages
            .find(Self::message_query(filter), options)
            .await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        documents
            .into_iter()
            .map(|d| bson::from_document(d).map_err(Into::into))
            .collect()
    }

    async fn count(&self, filter: &MessageFilter) -> Result<u64> {
        Ok(self
            .messages
            .count_documents(Self::message_query(filter), None)
            .await?)
    }

    async fn mark_read_by(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        let result = self
            .messages
            .update_many(
                doc! {
                    "conversation_id": conversation_id,
                    "sender_id": { "$ne": user_id },
                    "read_by": { "$ne": user_id },
                },
                doc! { "$addToSet": { "read_by": user_id } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn add_deleted_for_user(&self, message_id: &str, user_id: &str) -> Result<bool> {
        self.update_message(
            doc! { "_id": message_id },
            doc! { "$addToSet": { "deleted_for_users": user_id } },
        )
        .await
    }

    async fn mark_recalled(&self, message_id: &str, recalled_at: DateTime<Utc>) -> Result<bool> {
        self.update_message(
            doc! { "_id": message_id, "recalled": false },
            doc! { "$set": { "recalled": true, "recalled_at": to_bson(&recalled_at)? } },
        )
        .await
    }

    async fn set_pin(&self, message_id: &str, pin: Option<PinMark>) -> Result<bool> {
        let set = match pin {
            Some(mark) => doc! {
                "pinned": true,
                "pinned_by": mark.pinned_by,
                "pinned_at": to_bson(&mark.pinned_at)?,
            },
            None => doc! {
                "pinned": false,
                "pinned_by": Bson::Null,
                "pinned_at": Bson::Null,
            },
        };
        self.update_message(doc! { "_id": message_id }, doc! { "$set": set })
            .await
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<bool> {
        let field = format!("reactions.{emoji}");
        self.update_message(
            doc! { "_id": message_id },
            doc! { "$addToSet": { field: user_id } },
        )
        .await
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<bool> {
        let field = format!("reactions.{emoji}");
        let removed = self
            .update_message(
                doc! { "_id": message_id },
                doc! { "$pull": { &field: user_id } },
            )
            .await?;
        if removed {
            self.messages
                .update_one(
                    doc! { "_id": message_id, &field: { "$size": 0 } },
                    doc! { "$unset": { &field: "" } },
                    None,
                )
                .await?;
        }
        Ok(removed)
    }

    async fn apply_edit(
        &self,
        message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
        previous: EditRecord,
    ) -> Result<bool> {
        self.update_message(
            doc! { "_id": message_id, "recalled": false },
            doc! {
                "$set": {
                    "content": content,
                    "edited": true,
                    "edited_at": to_bson(&edited_at)?,
                },
                "$push": { "history": to_bson(&previous)? },
            },
        )
        .await
    }

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64> {
        let result = self
            .messages
            .delete_many(doc! { "conversation_id": conversation_id }, None)
            .await?;
        Ok(result.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::MessageKind;

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("a.b*c"), "a\\.b\\*c");
        assert_eq!(escape_regex("plain"), "plain");
    }

    #[test]
    fn test_message_query_translates_filter() {
        let cursor = Utc::now();
        let filter = MessageFilter::conversation("c1")
            .before(cursor)
            .without_recalled()
            .visible_to("bob")
            .unread_by("bob");
        let query = MongoChatStore::message_query(&filter);

        assert_eq!(query.get_str("conversation_id").unwrap(), "c1");
        assert!(!query.get_bool("recalled").unwrap());
        let range = query.get_document("sent_at_us").unwrap();
        assert_eq!(range.get_i64("$lt").unwrap(), cursor.timestamp_micros());
        assert_eq!(
            query
                .get_document("read_by")
                .unwrap()
                .get_str("$ne")
                .unwrap(),
            "bob"
        );
    }

    #[test]
    fn test_direct_documents_carry_sorted_pair_key() {
        let conversation = Conversation::new_direct("c1".into(), "zoe", "adam", Utc::now());
        let document = MongoChatStore::conversation_document(&conversation).unwrap();
        assert_eq!(document.get_str("direct_key").unwrap(), "adam|zoe");
        assert_eq!(document.get_str("_id").unwrap(), "c1");

        let message = Message::compose("c1", "zoe", "hi", MessageKind::Text, Utc::now());
        let document = MongoChatStore::message_document(&message).unwrap();
        assert_eq!(
            document.get_i64("sent_at_us").unwrap(),
            message.sent_at.timestamp_micros()
        );
    }
}
