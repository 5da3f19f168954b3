use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::application::ActionDispatcher;
use crate::config::ChatConfig;

pub mod wire;

pub use wire::{ApplicationContext, Infrastructure};

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点：stdin 读取 NDJSON 动作，stdout 写出响应
    pub async fn run(config: &ChatConfig) -> Result<()> {
        // 使用 Wire 风格的依赖注入构建应用上下文
        let context = wire::initialize(config).await?;
        info!("ApplicationBootstrap created successfully");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let outbox_dispatcher = context.outbox_dispatcher.clone();
        let dispatcher_shutdown = shutdown_rx.clone();
        let dispatcher_task =
            tokio::spawn(async move { outbox_dispatcher.run(dispatcher_shutdown).await });

        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received (Ctrl+C)");
                let _ = signal_tx.send(true);
            }
        });

        info!("flare-chat is reading actions from stdin");
        let handled = serve_lines(
            &context.dispatcher,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_rx,
        )
        .await?;

        let _ = shutdown_tx.send(true);
        if let Err(err) = dispatcher_task.await {
            warn!(error = %err, "Outbox dispatcher task ended abnormally");
        }

        info!(handled = handled, "flare-chat stopped");
        Ok(())
    }
}

/// 逐行处理请求，每行输出一条 JSON 响应；输入结束或收到关闭信号时返回已处理行数
pub async fn serve_lines<R, W>(
    dispatcher: &ActionDispatcher,
    reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut handled = 0usize;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read request line")? else {
                    debug!("Input closed");
                    break;
                };
                let request = line.trim();
                if request.is_empty() {
                    continue;
                }

                let response = dispatcher.dispatch_json(request).await;
                let mut payload =
                    serde_json::to_vec(&response).context("failed to encode response")?;
                payload.push(b'\n');
                writer.write_all(&payload).await?;
                writer.flush().await?;
                handled += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    Ok(handled)
}
