//! 领域服务单元测试用的内存装配

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::model::{
    Conversation, Destination, EditRecord, EventEnvelope, Message, MessageKind,
};
use crate::domain::repository::{
    ConversationRepository, EventPublisher, MessageFilter, MessageRepository, PinMark,
};
use crate::domain::service::pipeline::OutgoingMessage;
use crate::domain::service::{
    ConversationDirectoryService, DerivedStateCalculator, FanoutService, FanoutSettings,
    MessageDelivery, MessagePipelineService, MessageQueryService, QuerySettings,
    ReadTrackingService, VisibilityResolver,
};
use crate::infrastructure::external::StaticUserDirectory;
use crate::infrastructure::outbox::InMemoryOutbox;
use crate::infrastructure::persistence::InMemoryChatStore;

/// 记录所有成功投递的发布器，可切换为失败模式
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    delivered: Mutex<Vec<(Destination, EventEnvelope)>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn events_for(&self, destination: &Destination) -> Vec<EventEnvelope> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, destination: &Destination, envelope: &EventEnvelope) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("subscriber unreachable");
        }
        self.delivered
            .lock()
            .unwrap()
            .push((destination.clone(), envelope.clone()));
        Ok(())
    }
}

/// 委托给内存存储的消息仓储，可让系统日志写入失败
pub(crate) struct FaultyMessageStore {
    inner: Arc<InMemoryChatStore>,
    failing_system_logs: AtomicBool,
}

impl FaultyMessageStore {
    fn new(inner: Arc<InMemoryChatStore>) -> Self {
        Self {
            inner,
            failing_system_logs: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_system_logs(&self, failing: bool) {
        self.failing_system_logs.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageRepository for FaultyMessageStore {
    async fn insert(&self, message: &Message) -> Result<()> {
        if message.kind == MessageKind::SystemLog && self.failing_system_logs.load(Ordering::SeqCst)
        {
            bail!("message store unavailable");
        }
        MessageRepository::insert(self.inner.as_ref(), message).await
    }

    async fn find_by_id(&self, message_id: &str) -> Result<Option<Message>> {
        MessageRepository::find_by_id(self.inner.as_ref(), message_id).await
    }

    async fn query(&self, filter: &MessageFilter) -> Result<Vec<Message>> {
        MessageRepository::query(self.inner.as_ref(), filter).await
    }

    async fn count(&self, filter: &MessageFilter) -> Result<u64> {
        MessageRepository::count(self.inner.as_ref(), filter).await
    }

    async fn mark_read_by(&self, conversation_id: &str, user_id: &str) -> Result<u64> {
        MessageRepository::mark_read_by(self.inner.as_ref(), conversation_id, user_id).await
    }

    async fn add_deleted_for_user(&self, message_id: &str, user_id: &str) -> Result<bool> {
        MessageRepository::add_deleted_for_user(self.inner.as_ref(), message_id, user_id).await
    }

    async fn mark_recalled(&self, message_id: &str, recalled_at: DateTime<Utc>) -> Result<bool> {
        MessageRepository::mark_recalled(self.inner.as_ref(), message_id, recalled_at).await
    }

    async fn set_pin(&self, message_id: &str, pin: Option<PinMark>) -> Result<bool> {
        MessageRepository::set_pin(self.inner.as_ref(), message_id, pin).await
    }

    async fn add_reaction(&self, message_id: &str, emoji: &str, user_id: &str) -> Result<bool> {
        MessageRepository::add_reaction(self.inner.as_ref(), message_id, emoji, user_id).await
    }

    async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
    ) -> Result<bool> {
        MessageRepository::remove_reaction(self.inner.as_ref(), message_id, emoji, user_id).await
    }

    async fn apply_edit(
        &self,
        message_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
        previous: EditRecord,
    ) -> Result<bool> {
        MessageRepository::apply_edit(self.inner.as_ref(), message_id, content, edited_at, previous)
            .await
    }

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64> {
        MessageRepository::delete_by_conversation(self.inner.as_ref(), conversation_id).await
    }
}

pub(crate) struct TestEngine {
    pub store: Arc<InMemoryChatStore>,
    pub messages: Arc<FaultyMessageStore>,
    pub outbox: Arc<InMemoryOutbox>,
    pub publisher: Arc<RecordingPublisher>,
    pub users: Arc<StaticUserDirectory>,
    pub directory: Arc<ConversationDirectoryService>,
    pub pipeline: Arc<MessagePipelineService>,
    pub read_tracking: Arc<ReadTrackingService>,
    pub query: Arc<MessageQueryService>,
}

impl TestEngine {
    pub(crate) fn new() -> Self {
        let store = Arc::new(InMemoryChatStore::new());
        let outbox = Arc::new(InMemoryOutbox::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let users = Arc::new(StaticUserDirectory::default());

        let faulty = Arc::new(FaultyMessageStore::new(store.clone()));
        let conversations: Arc<dyn ConversationRepository> = store.clone();
        let messages: Arc<dyn MessageRepository> = faulty.clone();
        let resolver = VisibilityResolver::new();
        let derived = DerivedStateCalculator::new(messages.clone(), resolver);
        let fanout = Arc::new(FanoutService::new(
            outbox.clone(),
            publisher.clone(),
            derived.clone(),
            FanoutSettings::default(),
        ));
        let delivery = Arc::new(MessageDelivery::new(
            conversations.clone(),
            messages.clone(),
            fanout.clone(),
        ));
        let directory = Arc::new(ConversationDirectoryService::new(
            conversations.clone(),
            messages.clone(),
            delivery.clone(),
            fanout.clone(),
            derived.clone(),
            users.clone(),
        ));
        let pipeline = Arc::new(MessagePipelineService::new(
            conversations.clone(),
            messages.clone(),
            directory.clone(),
            delivery,
            fanout.clone(),
            derived.clone(),
            resolver,
        ));
        let read_tracking = Arc::new(ReadTrackingService::new(
            conversations.clone(),
            messages.clone(),
            derived,
            fanout,
        ));
        let query = Arc::new(MessageQueryService::new(
            conversations,
            messages,
            resolver,
            QuerySettings::default(),
        ));

        Self {
            store,
            messages: faulty,
            outbox,
            publisher,
            users,
            directory,
            pipeline,
            read_tracking,
            query,
        }
    }

    pub(crate) async fn group(&self, creator: &str, others: &[&str]) -> Conversation {
        self.directory
            .create_conversation(crate::domain::service::directory::NewConversation {
                kind: crate::domain::model::ConversationKind::Group,
                creator_id: creator.to_string(),
                members: others.iter().map(|m| m.to_string()).collect(),
                name: None,
                description: None,
                avatar_url: None,
            })
            .await
            .unwrap()
    }

    pub(crate) async fn send_text(&self, conversation_id: &str, sender: &str, content: &str) -> Message {
        self.pipeline
            .send(OutgoingMessage::text(conversation_id, sender, content))
            .await
            .unwrap()
    }

    pub(crate) async fn send_text_at(
        &self,
        conversation_id: &str,
        sender: &str,
        content: &str,
        sent_at: DateTime<Utc>,
    ) -> Message {
        let mut outgoing = OutgoingMessage::text(conversation_id, sender, content);
        outgoing.sent_at = Some(sent_at);
        self.pipeline.send(outgoing).await.unwrap()
    }

    pub(crate) async fn conversation(&self, conversation_id: &str) -> Conversation {
        ConversationRepository::find_by_id(self.store.as_ref(), conversation_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub(crate) async fn message(&self, message_id: &str) -> Message {
        MessageRepository::find_by_id(self.store.as_ref(), message_id)
            .await
            .unwrap()
            .unwrap()
    }
}
