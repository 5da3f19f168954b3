//! Flare Chat 会话引擎
//!
//! 会话与消息管理、按用户的消息可见性（仅自己删除、撤回）、已读 / 未读、
//! 回应、置顶，以及状态变更向实时订阅者的扇出。

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod logging;
pub mod metrics;
pub mod service;

pub use application::{ActionDispatcher, ActionResponse, ClientAction};
pub use config::{ChatConfig, ConfigManager, app_config, load_config};
pub use error::{ChatError, Result};
pub use service::{ApplicationBootstrap, ApplicationContext};
