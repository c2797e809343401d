//! Codesmith 命令行入口
//!
//! 加载配置、初始化日志、安装信号处理，运行命令行给出的任务，并把事件逐行输出为 JSON。

use anyhow::Context;
use codesmith::core::{AgentBuilder, ShutdownManager};
use codesmith::execution::TaskUpdate;
use codesmith::{load_config, observability};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load configuration")?;
    observability::init(&config.logging_level);

    let description = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if description.trim().is_empty() {
        anyhow::bail!("usage: codesmith <task description>");
    }

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let agent = AgentBuilder::new(config)
        .with_shutdown(shutdown)
        .build()
        .context("Failed to build agent")?;

    let mut stream = agent.execute_task(agent.task(description));
    let mut failed = false;
    while let Some(update) = stream.next().await {
        match update {
            TaskUpdate::Event(event) => {
                println!("{}", serde_json::to_string(&event).context("Failed to encode event")?);
            }
            TaskUpdate::Finished(Ok(outcome)) => {
                tracing::info!(
                    iterations = outcome.iterations,
                    tool_calls = outcome.tool_calls_made,
                    "task finished"
                );
            }
            TaskUpdate::Finished(Err(e)) => {
                tracing::error!(error = %e, kind = e.kind(), "task failed");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
