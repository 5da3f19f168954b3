use std::time::Duration;

use anyhow::{Context, Result};

use flare_chat::config::load_config;
use flare_chat::logging::init_tracing_from_config;
use flare_chat::service::ApplicationBootstrap;

fn main() -> Result<()> {
    // 第一个参数可指定配置文件路径
    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref());

    init_tracing_from_config(Some(&config.logging));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let result = runtime.block_on(ApplicationBootstrap::run(config));

    // stdin 的阻塞读取不会随关闭信号返回，限时关闭运行时
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}
