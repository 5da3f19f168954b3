//! 用户目录适配器：展示名解析

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::domain::repository::UserDirectory;

/// 静态展示名表（配置文件或测试注入）
#[derive(Default)]
pub struct StaticUserDirectory {
    names: RwLock<HashMap<String, String>>,
}

impl StaticUserDirectory {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self {
            names: RwLock::new(names),
        }
    }

    pub fn insert(&self, user_id: &str, display_name: &str) {
        let mut names = self.names.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        names.insert(user_id.to_string(), display_name.to_string());
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        let names = self
            .names
            .read()
            .map_err(|_| anyhow!("user directory lock poisoned"))?;
        Ok(names.get(user_id).cloned())
    }
}

#[derive(Deserialize)]
struct UserProfile {
    display_name: Option<String>,
}

/// 通过 HTTP 用户服务解析：`GET {base_url}/users/{user_id}`
pub struct HttpUserDirectory {
    client: Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn display_name(&self, user_id: &str) -> Result<Option<String>> {
        let url = format!("{}/users/{}", self.base_url, user_id);
        let response = self.client.get(&url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(user_id = %user_id, "User not found in directory");
            return Ok(None);
        }

        let profile: UserProfile = response.error_for_status()?.json().await?;
        Ok(profile.display_name.filter(|name| !name.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticUserDirectory::default();
        assert_eq!(directory.display_name("alice").await.unwrap(), None);

        directory.insert("alice", "Alice");
        assert_eq!(
            directory.display_name("alice").await.unwrap().as_deref(),
            Some("Alice")
        );
    }

    #[test]
    fn test_http_directory_trims_base_url() {
        let directory =
            HttpUserDirectory::new("http://users.local/", Duration::from_millis(500)).unwrap();
        assert_eq!(directory.base_url, "http://users.local");
    }
}
