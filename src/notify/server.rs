//! 通知 WebSocket 服务
//!
//! 客户端帧：`{"type":"subscribe","conversationId":"..."}`、`{"type":"unsubscribe",...}`、`{"type":"ping","timestamp":1}`
//! 服务端帧：`{"type":"signal","conversationId":"...","signal":"processing_started"}`，
//! 订阅成功后立即推送一次当前状态。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use super::{NotificationHub, Signal};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Subscribe { conversation_id: String },
    Unsubscribe { conversation_id: String },
    Ping { timestamp: Option<i64> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    Signal {
        conversation_id: String,
        signal: Signal,
    },
    Pong { timestamp: Option<i64> },
    Error { code: String, message: String },
}

impl ServerFrame {
    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 在 listener 上接受连接，直到 shutdown 被取消
pub async fn serve_notifications(
    listener: TcpListener,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Notification channel listening on ws://{}", addr);
    }
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let hub = Arc::clone(&hub);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, shutdown).await {
                            tracing::warn!("Notification connection error from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            }
        }
    }
    tracing::info!("Notification channel stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<NotificationHub>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

    tracing::debug!("Notification client connected: {}", addr);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(Ok(m)) => m,
                Some(Err(e)) => {
                    tracing::debug!("WebSocket receive error from {}: {}", addr, e);
                    break;
                }
                None => break,
            },
        };

        match msg {
            WsMessage::Text(text) => {
                let frame: ClientFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let error = ServerFrame::Error {
                            code: "parse_error".to_string(),
                            message: e.to_string(),
                        };
                        let _ = tx.send(error.to_json());
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Subscribe { conversation_id } => {
                        if forwarders.contains_key(&conversation_id) {
                            continue;
                        }
                        let handle = spawn_forwarder(&hub, &conversation_id, tx.clone());
                        forwarders.insert(conversation_id, handle);
                    }
                    ClientFrame::Unsubscribe { conversation_id } => {
                        if let Some(handle) = forwarders.remove(&conversation_id) {
                            handle.abort();
                        }
                    }
                    ClientFrame::Ping { timestamp } => {
                        let _ = tx.send(ServerFrame::Pong { timestamp }.to_json());
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    for (_, handle) in forwarders.drain() {
        handle.abort();
    }
    drop(tx);
    let _ = writer.await;
    tracing::debug!("Notification client disconnected: {}", addr);
    Ok(())
}

/// 推送当前状态，然后转发后续信号；任务被 abort 时订阅随之释放
fn spawn_forwarder(
    hub: &Arc<NotificationHub>,
    conversation_id: &str,
    tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    let mut subscription = hub.subscribe(conversation_id);
    let conversation_id = conversation_id.to_string();
    let frame = move |signal| {
        ServerFrame::Signal {
            conversation_id: conversation_id.clone(),
            signal,
        }
        .to_json()
    };
    let _ = tx.send(frame(subscription.current));
    tokio::spawn(async move {
        while let Some(signal) = subscription.recv().await {
            if tx.send(frame(signal)).is_err() {
                break;
            }
        }
    })
}
