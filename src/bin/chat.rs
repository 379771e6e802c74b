//! Hive 命令行对话
//!
//! 从 stdin 逐行读取消息，走同步入口跑一轮并打印回复；同一进程内续接同一会话。
//! 使用内存快照存储，不启用 Webhook。输入 /new 开始新会话，/quit 退出。
//!
//! 启动: cargo run --bin hive-chat [-- path/to/config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{ShutdownManager, ShutdownReason, TurnRequest};
use hive::{create_components, observability};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut cfg = load_config(config_path).context("Failed to load config")?;
    cfg.webhook.enabled = false;
    cfg.store.backend = "memory".to_string();

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let components = create_components(&cfg, Arc::clone(&shutdown))
        .await
        .context("Invalid configuration")?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut conversation_id: Option<String> = None;

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let message = line.trim();
        match message {
            "" => continue,
            "/quit" | "/exit" => {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            "/new" => {
                conversation_id = None;
                println!("(new conversation)");
                continue;
            }
            _ => {}
        }

        let mut request = TurnRequest::new(message);
        if let Some(id) = &conversation_id {
            request = request.in_conversation(id.clone());
        }
        match components
            .orchestrator
            .run_turn(request, shutdown.turn_token())
            .await
        {
            Ok(outcome) => {
                println!("{}", outcome.reply);
                tracing::debug!(stop_reason = %outcome.stop_reason, "Turn finished");
                conversation_id = Some(outcome.conversation_id);
            }
            Err(failure) => {
                tracing::warn!("Turn failed: {}", failure.error);
                println!("{}", components.orchestrator.fallback_reply());
                conversation_id = Some(failure.conversation_id);
            }
        }
    }

    Ok(())
}
