//! Flare Chat 配置模块
//!
//! - TOML 配置文件加载与解析
//! - 环境特定配置覆盖（`FLARE_ENV`）与环境变量覆盖
//! - 存储、实时投递、outbox、查询、用户目录、日志等配置定义

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::warn;

mod manager;
pub use manager::ConfigManager;

use crate::domain::service::{FanoutSettings, OutboxDispatcherSettings, QuerySettings};

/// 全局配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<ChatConfig> = OnceLock::new();

/// 日志配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（trace/debug/info/warn/error），RUST_LOG 优先
    pub level: String,
    /// 输出格式：text 或 json
    pub format: LogFormat,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Mongo,
}

/// 存储配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// MongoDB 连接 URL（mongo 后端必填）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mongo_url: Option<String>,
    pub mongo_database: String,
    pub conversations_collection: String,
    pub messages_collection: String,
    /// outbox 集合（仅 mongo 后端）
    pub outbox_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            mongo_url: None,
            mongo_database: "flare_chat".to_string(),
            conversations_collection: "conversations".to_string(),
            messages_collection: "messages".to_string(),
            outbox_collection: "chat_outbox".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeBackend {
    #[default]
    Memory,
    Redis,
}

/// 实时投递配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub backend: RealtimeBackend,
    /// Redis 地址（redis 后端必填）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// 频道名前缀
    pub channel_prefix: String,
    /// 内存 hub 每个频道的缓冲容量
    pub memory_channel_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            backend: RealtimeBackend::Memory,
            redis_url: None,
            channel_prefix: "flare:chat".to_string(),
            memory_channel_capacity: 256,
        }
    }
}

/// Outbox 配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// 写入 outbox 后立即尝试投递
    pub dispatch_inline: bool,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    /// 认领租约时长（秒）
    pub claim_lease_secs: u64,
    /// 已投递与已耗尽记录保留时长（秒）
    pub retention_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            dispatch_inline: true,
            batch_size: 100,
            poll_interval_ms: 500,
            max_attempts: 5,
            claim_lease_secs: 30,
            retention_secs: 3600,
        }
    }
}

impl OutboxConfig {
    pub fn fanout_settings(&self) -> FanoutSettings {
        FanoutSettings {
            dispatch_inline: self.dispatch_inline,
            claim_lease: Duration::from_secs(self.claim_lease_secs.max(1)),
        }
    }

    pub fn dispatcher_settings(&self) -> OutboxDispatcherSettings {
        OutboxDispatcherSettings {
            batch_size: self.batch_size.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            max_attempts: self.max_attempts.max(1),
            claim_lease: Duration::from_secs(self.claim_lease_secs.max(1)),
            retention: Duration::from_secs(self.retention_secs),
        }
    }
}

/// 分页与搜索配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub around_before: u64,
    pub around_after: u64,
    pub search_page_size: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        let defaults = QuerySettings::default();
        Self {
            default_page_size: defaults.default_page_size,
            max_page_size: defaults.max_page_size,
            around_before: defaults.around_before,
            around_after: defaults.around_after,
            search_page_size: defaults.search_page_size,
        }
    }
}

impl QueryConfig {
    pub fn settings(&self) -> QuerySettings {
        QuerySettings {
            default_page_size: self.default_page_size,
            max_page_size: self.max_page_size,
            around_before: self.around_before,
            around_after: self.around_after,
            search_page_size: self.search_page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryBackend {
    #[default]
    Static,
    Http,
}

/// 用户目录配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub backend: DirectoryBackend,
    /// HTTP 用户服务地址（http 后端必填）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    /// 静态展示名表：userId -> 展示名
    pub static_names: HashMap<String, String>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            backend: DirectoryBackend::Static,
            base_url: None,
            timeout_ms: 1000,
            static_names: HashMap::new(),
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatConfig {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub realtime: RealtimeConfig,
    pub outbox: OutboxConfig,
    pub query: QueryConfig,
    pub directory: DirectoryConfig,
}

impl ChatConfig {
    /// 解析 TOML 文本（不读取环境）
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: ChatConfig = toml::from_str(content).context("invalid config format")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验后端与必填项的组合
    pub fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Mongo && self.store.mongo_url.is_none() {
            return Err(anyhow!("store.mongo_url is required when store.backend = \"mongo\""));
        }
        if self.realtime.backend == RealtimeBackend::Redis && self.realtime.redis_url.is_none() {
            return Err(anyhow!(
                "realtime.redis_url is required when realtime.backend = \"redis\""
            ));
        }
        if self.directory.backend == DirectoryBackend::Http && self.directory.base_url.is_none() {
            return Err(anyhow!(
                "directory.base_url is required when directory.backend = \"http\""
            ));
        }
        if self.query.max_page_size == 0 {
            return Err(anyhow!("query.max_page_size must be positive"));
        }
        Ok(())
    }
}

/// 加载配置（进程内只加载一次）
pub fn load_config(path: Option<&str>) -> &'static ChatConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => vec![
            PathBuf::from("config/flare-chat.toml"),
            PathBuf::from("flare-chat.toml"),
        ],
    };

    APP_CONFIG.get_or_init(|| {
        let mut cfg = load_with_fallback(&candidates);
        if let Err(e) = ConfigManager::load_environment_config(&mut cfg) {
            warn!("failed to load environment config: {}", e);
        }
        ConfigManager::apply_env_overrides(&mut cfg);
        cfg
    })
}

/// 获取已加载的配置
pub fn app_config() -> Option<&'static ChatConfig> {
    APP_CONFIG.get()
}

fn load_with_fallback(candidates: &[PathBuf]) -> ChatConfig {
    for path in candidates {
        match load_config_from_file(path) {
            Ok(cfg) => return cfg,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    ChatConfig::default()
}

fn load_config_from_file(path: &Path) -> Result<ChatConfig> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config file: {}", path.display()))?;
    ChatConfig::from_toml_str(&content)
        .with_context(|| format!("invalid config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = ChatConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.realtime.channel_prefix, "flare:chat");
        assert_eq!(cfg.query.default_page_size, 30);
        assert_eq!(cfg.query.max_page_size, 200);
        assert_eq!(cfg.query.search_page_size, 20);
        assert!(cfg.outbox.dispatch_inline);
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_sections_are_parsed() {
        let cfg = ChatConfig::from_toml_str(
            r#"
            [logging]
            level = "debug"
            format = "json"

            [store]
            backend = "mongo"
            mongo_url = "mongodb://localhost:27017"
            mongo_database = "chat"

            [outbox]
            dispatch_inline = false
            max_attempts = 3
            poll_interval_ms = 250
            claim_lease_secs = 10

            [directory.static_names]
            alice = "Alice"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.store.backend, StoreBackend::Mongo);
        assert_eq!(cfg.store.mongo_database, "chat");
        assert_eq!(cfg.store.messages_collection, "messages");
        assert!(!cfg.outbox.fanout_settings().dispatch_inline);
        let dispatcher = cfg.outbox.dispatcher_settings();
        assert_eq!(dispatcher.max_attempts, 3);
        assert_eq!(dispatcher.poll_interval, Duration::from_millis(250));
        assert_eq!(dispatcher.claim_lease, Duration::from_secs(10));
        assert_eq!(cfg.outbox.fanout_settings().claim_lease, Duration::from_secs(10));
        assert_eq!(cfg.directory.static_names["alice"], "Alice");
    }

    #[test]
    fn test_backend_requirements_are_validated() {
        let err = ChatConfig::from_toml_str("[store]\nbackend = \"mongo\"").unwrap_err();
        assert!(err.to_string().contains("mongo_url"));

        let err = ChatConfig::from_toml_str("[realtime]\nbackend = \"redis\"").unwrap_err();
        assert!(err.to_string().contains("redis_url"));

        assert!(ChatConfig::from_toml_str("[store]\nbackend = \"sqlite\"").is_err());
    }
}
