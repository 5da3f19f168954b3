//! # 日志初始化模块
//!
//! 基于 `tracing-subscriber` 的 fmt 订阅器，支持文本与 JSON 两种输出格式。

use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingConfig};

/// 从配置初始化日志系统
///
/// # 参数
/// * `logging_config` - 日志配置（可选），为 None 时使用默认配置（info 级别、文本格式）
///
/// # 示例
/// ```rust,ignore
/// use flare_chat::config::LoggingConfig;
/// use flare_chat::logging::init_tracing_from_config;
///
/// init_tracing_from_config(None);
///
/// let config = LoggingConfig {
///     level: "debug".to_string(),
///     with_line_number: true,
///     ..Default::default()
/// };
/// init_tracing_from_config(Some(&config));
/// ```
///
/// 重复初始化时忽略错误（测试中可能多次调用）。
pub fn init_tracing_from_config(logging_config: Option<&LoggingConfig>) {
    let default_config = LoggingConfig::default();
    let config = logging_config.unwrap_or(&default_config);

    // 优先使用环境变量 RUST_LOG，如果没有则使用配置文件的日志级别
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = fmt::Subscriber::builder()
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .with_file(config.with_file)
        .with_line_number(config.with_line_number)
        .with_env_filter(env_filter);

    // stdout 留给动作响应，日志统一写 stderr
    let result = match config.format {
        LogFormat::Json => builder
            .json()
            .with_writer(std::io::stderr)
            .try_init(),
        LogFormat::Text => builder.with_writer(std::io::stderr).try_init(),
    };

    if let Err(err) = result {
        eprintln!("tracing subscriber already initialized: {err}");
    }
}
