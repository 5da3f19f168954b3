//! 内存版存储实现
//!
//! 用于开发、测试与单进程部署。每个变更在写锁内完成，等价于存储端的单文档原子更新。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::model::{
    Conversation, ConversationMetaUpdate, ConversationPreference, EditRecord, Message,
};
use crate::domain::repository::{
    ConversationRepository, MessageFilter, MessageRepository, PinMark, SortOrder,
};

#[derive(Default)]
pub struct InMemoryChatStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn direct_key(user_a: &str, user_b: &str) -> (String, String) {
        if user_a <= user_b {
            (user_a.to_string(), user_b.to_string())
        } else {
            (user_b.to_string(), user_a.to_string())
        }
    }

    fn find_direct_locked<'a>(
        conversations: &'a HashMap<String, Conversation>,
        user_a: &str,
        user_b: &str,
    ) -> Option<&'a Conversation> {
        conversations
            .values()
            .find(|c| c.is_direct() && c.has_member_pair(user_a, user_b))
    }

    fn select(messages: &HashMap<String, Message>, filter: &MessageFilter) -> Vec<Message> {
        let mut matched: Vec<&Message> = messages.values().filter(|m| filter.matches(m)).collect();
        matched.sort_by(|a, b| (a.sent_at, &a.id).cmp(&(b.sent_at, &b.id)));
        if filter.order == SortOrder::Descending {
            matched.reverse();
        }

        let limit = filter.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        matched
            .into_iter()
            .skip(filter.offset as usize)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryChatStore {
    async fn insert(&self, conversation: &Conversation) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(&conversation.id) {
            return Err(anyhow!("conversation {} already exists", conversation.id));
        }
        conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn find_by_id(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn find_direct(&self, user_a: &str, user_b: &str) -> Result<Option<Conversation>> {
        let conversations = self.conversations.read().await;
        Ok(Self::find_direct_locked(&conversations, user_a, user_b).cloned())
    }

    async fn insert_direct_if_absent(&self, conversation: &Conversation) -> Result<Conversation> {
        let (a, b) = match conversation.members.as_slice() {
            [a, b] => Self::direct_key(a, b),
            _ => return Err(anyhow!("direct conversation must have exactly two members")),
        };

        let mut conversations = self.conversations.write().await;
        if let Some(existing) = Self::find_direct_locked(&conversations, &a, &b) {
            return Ok(existing.clone());
        }
        conversations.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation.clone())
    }

    async fn list_for_member(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let conversations = self.conversations.read().await;
        let mut listed: Vec<Conversation> = conversations
            .values()
            .filter(|c| c.is_member(user_id))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(listed)
    }

    async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let mut conversations = self.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return Ok(false);
        };
        if conversation.is_member(user_id) {
            return Ok(false);
        }
        conversation.members.push(user_id.to_string());
        Ok(true)
    }

    async fn remove_member(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        let mut conversations = self.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return Ok(false);
        };
        let before = conversation.members.len();
        conversation.members.retain(|m| m != user_id);
        Ok(conversation.members.len() != before)
    }

    async fn add_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            if !conversation.pinned_message_ids.iter().any(|id| id == message_id) {
                conversation.pinned_message_ids.push(message_id.to_string());
            }
        }
        Ok(())
    }

    async fn remove_pinned_message(&self, conversation_id: &str, message_id: &str) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.pinned_message_ids.retain(|id| id != message_id);
        }
        Ok(())
    }

    async fn replace_pinned_messages(
        &self,
        conversation_id: &str,
        message_ids: &[String],
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.pinned_message_ids = message_ids.to_vec();
        }
        Ok(())
    }

    async fn set_last_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation
                .last_read_message_id
                .insert(user_id.to_string(), message_id.to_string());
        }
        Ok(())
    }

    async fn set_preference(
        &self,
        conversation_id: &str,
        user_id: &str,
        preference: ConversationPreference,
        enabled: bool,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            let set = conversation.preference_set_mut(preference);
            if enabled {
                set.insert(user_id.to_string());
            } else {
                set.remove(user_id);
            }
        }
        Ok(())
    }

    async fn update_meta(
        &self,
        conversation_id: &str,
        update: &ConversationMetaUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            update.apply(conversation);
            conversation.updated_at = conversation.updated_at.max(updated_at);
        }
        Ok(())
    }

    async fn touch(&self, conversation_id: &str, updated_at: DateTime<Utc>) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        if let Some(conversation) = conversations.get_mut(conversation_id) {
            conversation.updated_at = conversation.updated_at.max(updated_at);
        }
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<bool> {
        Ok(self
            .conversations
            .write()
            .await
            .remove(conversation_id)
            .is_some())
    }
}

#[async_trait]
impl MessageRepository for InMemoryChatStore {
    async fn insert(&self, message: &Message) -> Result<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(anyhow!("message {} already exists", message.id));
        }
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(message_id).cloned())
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        Ok(Self::select(&messages, filter))
    }

    async fn count(&self, filter: &MessageFilter) -> Result<u64> {
        let messages = self.messages.read().await;
        Ok(messages.values().filter(|m| filter.matches(m)).count() as u64)
    }

    async fn mark_read_by(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        let mut messages = self.messages.write().await;
        let mut updated = 0u64;
        for message in messages.values_mut() {
            if message.conversation_id == conversation_id
                && message.sender_id != user_id
                && message.read_by.insert(user_id.to_string())
            {
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn add_deleted_for_user(&self, message_id: &str, user_id: &str) -> Result<bool> {
        let mut messages = self.messages.write().await;
        Ok(messages
            .get_mut(message_id)
            .map(|m| m.deleted_for_users.insert(user_id.to_string()))
            .unwrap_or(false))
    }

    async fn mark_recalled(&self, message_id: &str, recalled_at: DateTime<Utc>) -> Result<bool> {
        let mut messages = self.messages.write().await;
        match messages.get_mut(message_id) {
            Some(message) if !message.recalled => {
                message.recalled = true;
                message.recalled_at = Some(recalled_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_pin(&self, message_id: &str, pin: Option<PinMark>) -> Result<bool> {
        let mut messages = self.messages.write().await;
        let Some(message) = messages.get_mut(message_id) else {
            return Ok(false);
        };
        match pin {
            Some(mark) => {
                message.pinned = true;
                message.pinned_by = Some(mark.pinned_by);
                message.pinned_at = Some(mark.pinned_at);
            }
            None => {
                message.pinned = false;
                message.pinned_by = None;
                message.pinned_at = None;
            }
        }
        Ok(true)
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<bool> {
        let mut messages = self.messages.write().await;
        Ok(messages
            .get_mut(message_id)
            .map(|m| {
                m.reactions
                    .entry(emoji.to_string())
                    .or_default()
                    .insert(user_id.to_string())
            })
            .unwrap_or(false))
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<bool> {
        let mut messages = self.messages.write().await;
        let Some(message) = messages.get_mut(message_id) else {
            return Ok(false);
        };
        let Some(users) = message.reactions.get_mut(emoji) else {
            return Ok(false);
        };
        let removed = users.remove(user_id);
        if users.is_empty() {
            message.reactions.remove(emoji);
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
        let mut messages = self.messages.write().await;
        match messages.get_mut(message_id) {
            Some(message) if !message.recalled => {
                message.history.push(previous);
                message.content = content.to_string();
                message.edited = true;
                message.edited_at = Some(edited_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| m.conversation_id != conversation_id);
        Ok((before - messages.len()) as u64)
    }
}
