//! Flare Chat 错误模块
//!
//! - 领域 / 应用层统一返回 [`ChatError`]
//! - 基础设施层（仓储、推送）返回 `anyhow::Result`，经 `?` 转为 [`ChatError::Storage`]

use thiserror::Error;

/// 会话引擎错误类型
#[derive(Debug, Error)]
pub enum ChatError {
    /// 会话或消息不存在
    #[error("not found: {0}")]
    NotFound(String),

    /// 无权限（非成员、非创建者、非发送者）
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 参数缺失或不合法
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 存储层错误
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn not_found(what: impl Into<String>) -> Self {
        ChatError::NotFound(what.into())
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        ChatError::PermissionDenied(reason.into())
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        ChatError::InvalidArgument(reason.into())
    }

    /// 对外暴露的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::PermissionDenied(_) => "PERMISSION_DENIED",
            ChatError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ChatError::Storage(_) => "INTERNAL",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// 便捷宏：条件不满足时提前返回 `PermissionDenied`
#[macro_export]
macro_rules! ensure_permission {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::ChatError::PermissionDenied(format!($($arg)+)));
        }
    };
}
