//! 配置管理器 - 负责环境特定配置与环境变量覆盖

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;
use tracing::info;

use super::{ChatConfig, DirectoryBackend, RealtimeBackend, StoreBackend};

pub const ENV_MONGO_URL: &str = "FLARE_CHAT_MONGO_URL";
pub const ENV_REDIS_URL: &str = "FLARE_CHAT_REDIS_URL";
pub const ENV_LOG_LEVEL: &str = "FLARE_CHAT_LOG_LEVEL";
pub const ENV_DIRECTORY_URL: &str = "FLARE_CHAT_DIRECTORY_URL";

pub struct ConfigManager;

impl ConfigManager {
    /// 当前环境名称，`FLARE_ENV` 未设置时为 "development"
    pub fn get_environment() -> String {
        env::var("FLARE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// 合并 `config/environments/{env}.toml`（存在时）
    pub fn load_environment_config(base_config: &mut ChatConfig) -> Result<()> {
        let env = Self::get_environment();
        let path = format!("config/environments/{}.toml", env);
        if !Path::new(&path).exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("unable to read environment config: {}", path))?;
        let overlay: Value = toml::from_str(&content)
            .with_context(|| format!("invalid environment config: {}", path))?;

        *base_config = Self::merge(base_config, overlay)?;
        info!(environment = %env, "Environment config applied");
        Ok(())
    }

    /// 在已加载配置上叠加一段 TOML
    pub fn merge(base: &ChatConfig, overlay: Value) -> Result<ChatConfig> {
        let mut merged = Value::try_from(base)
            .context("failed to serialize base config")?;
        Self::merge_value(&mut merged, overlay);
        let cfg: ChatConfig = merged
            .try_into()
            .context("invalid configuration after merging")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 环境变量覆盖；提供 URL 时同时切换对应后端
    pub fn apply_env_overrides(config: &mut ChatConfig) {
        Self::apply_overrides(config, |key| env::var(key).ok());
    }

    pub(crate) fn apply_overrides(config: &mut ChatConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_MONGO_URL).filter(|v| !v.is_empty()) {
            config.store.mongo_url = Some(url);
            config.store.backend = StoreBackend::Mongo;
        }
        if let Some(url) = lookup(ENV_REDIS_URL).filter(|v| !v.is_empty()) {
            config.realtime.redis_url = Some(url);
            config.realtime.backend = RealtimeBackend::Redis;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
            config.logging.level = level;
        }
        if let Some(url) = lookup(ENV_DIRECTORY_URL).filter(|v| !v.is_empty()) {
            config.directory.base_url = Some(url);
            config.directory.backend = DirectoryBackend::Http;
        }
    }

    fn merge_value(base: &mut Value, overlay: Value) {
        match overlay {
            Value::Table(overlay_table) => {
                if let Value::Table(base_table) = base {
                    for (key, overlay_value) in overlay_table.into_iter() {
                        match base_table.get_mut(&key) {
                            Some(base_value) => Self::merge_value(base_value, overlay_value),
                            None => {
                                base_table.insert(key, overlay_value);
                            }
                        }
                    }
                } else {
                    *base = Value::Table(overlay_table);
                }
            }
            other => {
                *base = other;
            }
        }
    }
}
