//! Hive HTTP 服务
//!
//! 启动: cargo run --bin hive-web --features web
//! 接口见 `hive::api`，默认监听 http://127.0.0.1:8080

use std::path::PathBuf;

use anyhow::Context;
use hive::daemon::Daemon;
use hive::{api, observability};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let daemon = Daemon::start(config_path).await?;

    let addr = daemon.config().server.addr();
    let app = api::router(daemon.engine().clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "http api listening");

    let token = daemon.shutdown_manager().token();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    });

    daemon.run_until_shutdown().await;
    server.await.context("http server task panicked")??;

    Ok(())
}
