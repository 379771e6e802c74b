//! Webhook 接入流水线
//!
//! 对每条通知：
//! 1. 订阅类型过滤 + 按 message id 取租约（重复投递直接丢弃）
//! 2. 后台任务中拉取消息详情，只处理“访客发来的普通入站消息”
//! 3. 发出“处理中”信号；无人订阅时先同步发送确认回复
//! 4. 调用编排器跑一轮
//! 5. 发出“处理完成”、发送最终回复、释放租约（RAII 保证执行）
//!
//! HTTP 入口只负责调用 [`WebhookPipeline::accept_batch`] 并立刻返回 202。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio::task::JoinHandle;

use crate::core::shutdown::ShutdownCleanup;
use crate::core::{HiveError, ShutdownManager, TurnOrchestrator, TurnRequest};
use crate::integrations::{ConversationPlatform, ReplyMode, ReplyTarget};
use crate::notify::NotificationHub;

use super::dedup::{DedupGuard, DedupLease};

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Num(u64),
    Str(String),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Num(n) => n.to_string(),
            RawId::Str(s) => s,
        }
    }
}

fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    RawId::deserialize(d).map(String::from)
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<RawId>::deserialize(d)?.map(String::from))
}

/// 单条 Webhook 通知（数字 ID 统一转成字符串）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    #[serde(deserialize_with = "id_string")]
    pub event_id: String,
    pub subscription_type: String,
    /// 会话线程 ID
    #[serde(deserialize_with = "id_string")]
    pub object_id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<i64>,
}

/// 流水线依赖与文案
pub struct WebhookPipeline {
    orchestrator: Arc<TurnOrchestrator>,
    platform: Arc<dyn ConversationPlatform>,
    notifier: Arc<NotificationHub>,
    dedup: DedupGuard,
    shutdown: Arc<ShutdownManager>,
    subscription_types: HashSet<String>,
    reply_mode: ReplyMode,
    ack_reply: String,
}

impl WebhookPipeline {
    pub fn new(
        orchestrator: Arc<TurnOrchestrator>,
        platform: Arc<dyn ConversationPlatform>,
        notifier: Arc<NotificationHub>,
        dedup: DedupGuard,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        Self {
            orchestrator,
            platform,
            notifier,
            dedup,
            shutdown,
            subscription_types: ["conversation.newMessage".to_string()].into_iter().collect(),
            reply_mode: ReplyMode::Message,
            ack_reply: "Thanks, we received your message and are looking into it.".to_string(),
        }
    }

    pub fn with_subscription_types(mut self, types: impl IntoIterator<Item = String>) -> Self {
        self.subscription_types = types.into_iter().collect();
        self
    }

    pub fn with_reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }

    pub fn with_ack_reply(mut self, text: impl Into<String>) -> Self {
        self.ack_reply = text.into();
        self
    }

    pub fn in_flight(&self) -> usize {
        self.dedup.in_flight()
    }

    /// 过滤 + 去重后为每条通知起一个后台任务，立即返回
    pub fn accept_batch(self: &Arc<Self>, batch: Vec<WebhookNotification>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for notification in batch {
            if !self.subscription_types.contains(&notification.subscription_type) {
                tracing::debug!(
                    event_id = %notification.event_id,
                    subscription_type = %notification.subscription_type,
                    "Ignoring unsubscribed event type"
                );
                continue;
            }
            let Some(message_id) = notification.message_id.clone() else {
                tracing::debug!(event_id = %notification.event_id, "Notification without message id, ignoring");
                continue;
            };
            let Some(lease) = self.dedup.acquire(&message_id) else {
                tracing::warn!(
                    event_id = %notification.event_id,
                    message_id = %message_id,
                    "Duplicate delivery ignored"
                );
                continue;
            };

            tracing::info!(
                event_id = %notification.event_id,
                conversation_id = %notification.object_id,
                message_id = %message_id,
                "Webhook accepted, processing in background"
            );
            let pipeline = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pipeline.process(notification, message_id, lease).await;
            }));
        }
        handles
    }

    async fn process(&self, notification: WebhookNotification, message_id: String, mut lease: DedupLease) {
        let thread_id = notification.object_id;
        let cancel = self.shutdown.turn_token();

        let detail = match self.platform.fetch_message(&thread_id, &message_id, &cancel).await {
            Ok(detail) => detail,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %thread_id,
                    message_id = %message_id,
                    "Fetching message detail failed, leaving for redelivery: {}",
                    e
                );
                return;
            }
        };
        if !detail.is_relevant() {
            tracing::debug!(
                conversation_id = %thread_id,
                message_id = %message_id,
                message_type = %detail.message_type,
                sender = ?detail.sender_actor_id(),
                "Irrelevant message dropped"
            );
            lease.mark_completed();
            return;
        }
        let text = detail.plain_text();
        if text.is_empty() {
            tracing::debug!(conversation_id = %thread_id, message_id = %message_id, "Empty message dropped");
            lease.mark_completed();
            return;
        }

        let target = ReplyTarget::from_detail(thread_id.clone(), &detail);
        let active = self.notifier.begin(&thread_id);
        if !active.had_subscribers {
            if let Err(e) = self
                .platform
                .post_reply(&target, &self.ack_reply, self.reply_mode, &cancel)
                .await
            {
                tracing::warn!(conversation_id = %thread_id, "Acknowledgement failed: {}", e);
            }
        }

        let result = self
            .orchestrator
            .run_turn(TurnRequest::new(text).in_conversation(thread_id.clone()), cancel.clone())
            .await;
        drop(active);

        let reply = match result {
            Ok(outcome) => {
                lease.mark_completed();
                outcome.reply
            }
            Err(failure) if matches!(failure.error, HiveError::Cancelled) => {
                tracing::info!(conversation_id = %thread_id, "Turn cancelled, no reply sent");
                return;
            }
            Err(failure) => {
                tracing::warn!(
                    conversation_id = %thread_id,
                    message_id = %message_id,
                    kind = failure.error.kind(),
                    "Turn failed, sending generic reply: {}",
                    failure.error
                );
                self.orchestrator.fallback_reply().to_string()
            }
        };

        match self
            .platform
            .post_reply(&target, &reply, self.reply_mode, &cancel)
            .await
        {
            Ok(()) => tracing::info!(conversation_id = %thread_id, message_id = %message_id, "Reply sent"),
            Err(e) => tracing::error!(conversation_id = %thread_id, "Reply dispatch failed: {}", e),
        }
    }
}

/// 关闭时等待后台 Webhook 任务退出（它们的轮次已随关闭信号取消）
pub struct DrainWebhooks {
    pipeline: Arc<WebhookPipeline>,
}

impl DrainWebhooks {
    pub fn new(pipeline: Arc<WebhookPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for DrainWebhooks {
    async fn cleanup(&self) -> anyhow::Result<()> {
        while self.pipeline.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "WebhookTasks"
    }
}
