//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建仓储、推送、领域服务与处理器

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::application::{ActionDispatcher, ChatCommandHandler, ChatQueryHandler};
use crate::config::{ChatConfig, DirectoryBackend, RealtimeBackend, StoreBackend};
use crate::domain::repository::{
    ConversationRepository, EventPublisher, MessageRepository, OutboxRepository, UserDirectory,
};
use crate::domain::service::{
    ConversationDirectoryService, DerivedStateCalculator, FanoutService, MessageDelivery,
    MessagePipelineService, MessageQueryService, OutboxDispatcher, ReadTrackingService,
    VisibilityResolver,
};
use crate::infrastructure::external::{HttpUserDirectory, StaticUserDirectory};
use crate::infrastructure::messaging::{LocalRealtimeHub, RedisRealtimePublisher};
use crate::infrastructure::outbox::{InMemoryOutbox, MongoOutbox};
use crate::infrastructure::persistence::{InMemoryChatStore, MongoChatStore};

/// 基础设施依赖
pub struct Infrastructure {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub outbox: Arc<dyn OutboxRepository>,
    pub publisher: Arc<dyn EventPublisher>,
    pub users: Arc<dyn UserDirectory>,
    /// 内存实时后端时可直接订阅
    pub hub: Option<Arc<LocalRealtimeHub>>,
}

impl Infrastructure {
    /// 全内存装配：内存存储、内存 outbox、进程内 hub、静态用户目录
    pub fn in_memory(config: &ChatConfig) -> Self {
        let store = Arc::new(InMemoryChatStore::new());
        let hub = Arc::new(LocalRealtimeHub::new(
            config.realtime.channel_prefix.clone(),
            config.realtime.memory_channel_capacity,
        ));
        Self {
            conversations: store.clone(),
            messages: store,
            outbox: Arc::new(InMemoryOutbox::new()),
            publisher: hub.clone(),
            users: static_directory(config),
            hub: Some(hub),
        }
    }

    /// 替换推送实现（保留其余依赖）
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self.hub = None;
        self
    }
}

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub commands: Arc<ChatCommandHandler>,
    pub queries: Arc<ChatQueryHandler>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub outbox_dispatcher: Arc<OutboxDispatcher>,
    pub hub: Option<Arc<LocalRealtimeHub>>,
}

/// 构建应用上下文
///
/// 按配置选择各后端，依次连接 MongoDB / Redis / 用户服务
pub async fn initialize(config: &ChatConfig) -> Result<ApplicationContext> {
    // 1. 存储与 outbox
    let (conversations, messages, outbox): (
        Arc<dyn ConversationRepository>,
        Arc<dyn MessageRepository>,
        Arc<dyn OutboxRepository>,
    ) = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryChatStore::new());
            (store.clone(), store, Arc::new(InMemoryOutbox::new()))
        }
        StoreBackend::Mongo => {
            let store = Arc::new(
                MongoChatStore::connect(&config.store)
                    .await
                    .context("Failed to connect to MongoDB")?,
            );
            let outbox = MongoOutbox::new(store.database(), &config.store.outbox_collection)
                .await
                .context("Failed to prepare outbox collection")?;
            (store.clone(), store, Arc::new(outbox))
        }
    };

    // 2. 实时推送
    let (publisher, hub): (Arc<dyn EventPublisher>, Option<Arc<LocalRealtimeHub>>) =
        match config.realtime.backend {
            RealtimeBackend::Memory => {
                let hub = Arc::new(LocalRealtimeHub::new(
                    config.realtime.channel_prefix.clone(),
                    config.realtime.memory_channel_capacity,
                ));
                (hub.clone(), Some(hub))
            }
            RealtimeBackend::Redis => {
                let redis_url = config
                    .realtime
                    .redis_url
                    .as_deref()
                    .context("realtime.redis_url is required for the redis backend")?;
                let publisher =
                    RedisRealtimePublisher::connect(redis_url, config.realtime.channel_prefix.clone())
                        .await
                        .context("Failed to connect to Redis")?;
                (Arc::new(publisher), None)
            }
        };

    // 3. 用户目录
    let users: Arc<dyn UserDirectory> = match config.directory.backend {
        DirectoryBackend::Static => static_directory(config),
        DirectoryBackend::Http => {
            let base_url = config
                .directory
                .base_url
                .as_deref()
                .context("directory.base_url is required for the http backend")?;
            Arc::new(HttpUserDirectory::new(
                base_url,
                Duration::from_millis(config.directory.timeout_ms),
            )?)
        }
    };

    info!(
        store = ?config.store.backend,
        realtime = ?config.realtime.backend,
        directory = ?config.directory.backend,
        "Chat infrastructure ready"
    );

    Ok(assemble(
        config,
        Infrastructure {
            conversations,
            messages,
            outbox,
            publisher,
            users,
            hub,
        },
    ))
}

/// 全内存应用上下文（测试与本地体验）
pub fn initialize_in_memory(config: &ChatConfig) -> ApplicationContext {
    assemble(config, Infrastructure::in_memory(config))
}

/// 在给定基础设施上构建领域服务与处理器
pub fn assemble(config: &ChatConfig, infra: Infrastructure) -> ApplicationContext {
    let Infrastructure {
        conversations,
        messages,
        outbox,
        publisher,
        users,
        hub,
    } = infra;

    let resolver = VisibilityResolver::new();
    let derived = DerivedStateCalculator::new(messages.clone(), resolver);

    let fanout = Arc::new(FanoutService::new(
        outbox.clone(),
        publisher.clone(),
        derived.clone(),
        config.outbox.fanout_settings(),
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
        users,
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
        config.query.settings(),
    ));

    let commands = Arc::new(ChatCommandHandler::new(
        directory.clone(),
        pipeline.clone(),
        read_tracking.clone(),
    ));
    let queries = Arc::new(ChatQueryHandler::new(
        directory,
        pipeline,
        read_tracking,
        query,
    ));
    let dispatcher = Arc::new(ActionDispatcher::new(commands.clone(), queries.clone()));
    let outbox_dispatcher = Arc::new(OutboxDispatcher::new(
        outbox,
        publisher,
        config.outbox.dispatcher_settings(),
    ));

    ApplicationContext {
        commands,
        queries,
        dispatcher,
        outbox_dispatcher,
        hub,
    }
}

fn static_directory(config: &ChatConfig) -> Arc<dyn UserDirectory> {
    Arc::new(StaticUserDirectory::new(
        config.directory.static_names.clone(),
    ))
}
