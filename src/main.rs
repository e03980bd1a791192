//! Hive - 智能体执行引擎守护进程
//!
//! 入口：初始化日志，装配引擎、恢复未完成的 Execution、启动定时触发，直到 Ctrl+C / SIGTERM。
//! 用法：`hive [config.toml]`

use std::path::PathBuf;

use hive::daemon::Daemon;
use hive::observability;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let daemon = Daemon::start(config_path).await?;
    daemon.run_until_shutdown().await;

    Ok(())
}
