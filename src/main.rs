//! Hive 服务端
//!
//! 入口：加载配置、初始化日志、装配组件，启动 HTTP（对话 + Webhook）与通知 WebSocket，
//! 收到 Ctrl+C / SIGTERM 后取消进行中的轮次并等待后台任务退出。
//!
//! 启动: cargo run --bin hive [-- path/to/config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::api::create_router;
use hive::config::load_config;
use hive::core::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
use hive::notify::serve_notifications;
use hive::webhook::DrainWebhooks;
use hive::{create_components, observability};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let components = create_components(&cfg, Arc::clone(&shutdown))
        .await
        .context("Invalid configuration")?;

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown))
        .with_timeout(cfg.orchestrator.turn_timeout_secs.min(30));
    if let Some(pipeline) = &components.pipeline {
        coordinator.register(DrainWebhooks::new(Arc::clone(pipeline)));
    }

    let notify_listener = TcpListener::bind(&cfg.server.notify_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.notify_addr))?;
    let notify_task = tokio::spawn(serve_notifications(
        notify_listener,
        Arc::clone(&components.notifier),
        shutdown.token(),
    ));

    let listener = TcpListener::bind(&cfg.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind_addr))?;
    tracing::info!("{} listening on http://{}", cfg.app.name, cfg.server.bind_addr);

    let mut reasons = shutdown.subscribe();
    let reason_task = tokio::spawn(async move {
        match reasons.recv().await {
            Ok(ShutdownReason::FatalError(cause)) => {
                tracing::error!(cause = %cause, "Shutting down after fatal error")
            }
            Ok(reason) => tracing::info!(reason = ?reason, "Shutting down"),
            Err(_) => {}
        }
    });

    shutdown.install_signal_handlers();
    let token = shutdown.token();
    axum::serve(listener, create_router(components.api_state()))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed")?;

    let manager = coordinator.manager();
    if !manager.is_shutdown() {
        manager.shutdown(ShutdownReason::FatalError("HTTP server exited".to_string()));
    }
    let _ = reason_task.await;
    coordinator.run_cleanup().await;
    let _ = notify_task.await;
    tracing::info!("Shutdown complete");
    Ok(())
}
