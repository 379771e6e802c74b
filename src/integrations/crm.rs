//! CRM 会话平台客户端（HubSpot Conversations 风格 API）
//!
//! - `GET  /conversations/v3/conversations/threads/{thread}/messages/{message}`：消息详情
//! - `POST /conversations/v3/conversations/threads/{thread}/messages`：回复（MESSAGE 或内部 COMMENT）
//! - `POST /crm/v3/objects/tickets`：创建工单并关联到会话线程
//!
//! 只有“访客发来的普通消息”才会触发一轮编排，见 [`MessageDetail::is_relevant`]。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::http::{CallError, ResilientClient};

use super::{chunk_text, path_segment, ConversationPlatform, MAX_REPLY_CHARS};

/// 访客 actor ID 前缀（坐席为 A-，机器人为 B-，系统为 S-）
const VISITOR_PREFIX: &str = "V-";
/// 工单 → 会话线程的关联类型
const TICKET_TO_THREAD_ASSOCIATION: u32 = 32;

/// 回复方式：对外消息，或仅坐席可见的内部备注
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    #[default]
    Message,
    Comment,
}

impl ReplyMode {
    fn wire_type(self) -> &'static str {
        match self {
            ReplyMode::Message => "MESSAGE",
            ReplyMode::Comment => "COMMENT",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub actor_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// 消息详情（只保留编排需要的字段）
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDetail {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rich_text: Option<String>,
    #[serde(default)]
    pub senders: Vec<MessageSender>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub channel_account_id: Option<String>,
}

impl MessageDetail {
    pub fn sender_actor_id(&self) -> Option<&str> {
        self.senders.first().map(|s| s.actor_id.as_str())
    }

    /// 普通消息 + 入站 + 发送者为外部访客；坐席 / 机器人的回声与系统事件都会被过滤
    pub fn is_relevant(&self) -> bool {
        self.message_type == "MESSAGE"
            && self.direction.as_deref() == Some("INCOMING")
            && self
                .sender_actor_id()
                .is_some_and(|id| id.starts_with(VISITOR_PREFIX))
    }

    /// 纯文本正文：优先 text，其次把 richText (HTML) 转为文本
    pub fn plain_text(&self) -> String {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return text.trim().to_string();
        }
        match self.rich_text.as_deref() {
            Some(html) => html2text::from_read(html.as_bytes(), 120)
                .unwrap_or_else(|_| html.to_string())
                .trim()
                .to_string(),
            None => String::new(),
        }
    }
}

/// 回复目标：线程 + 原消息所在渠道
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub thread_id: String,
    pub channel_id: Option<String>,
    pub channel_account_id: Option<String>,
}

impl ReplyTarget {
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            channel_id: None,
            channel_account_id: None,
        }
    }

    /// 在原消息所在的渠道上回复
    pub fn from_detail(thread_id: impl Into<String>, detail: &MessageDetail) -> Self {
        Self {
            thread_id: thread_id.into(),
            channel_id: detail.channel_id.clone(),
            channel_account_id: detail.channel_account_id.clone(),
        }
    }
}

/// 待创建的工单
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    pub subject: String,
    pub content: String,
    /// 关联的会话线程
    pub thread_id: String,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub id: String,
}

/// CRM 客户端
pub struct CrmClient {
    http: ResilientClient,
    sender_actor_id: Option<String>,
    pipeline: String,
    stage: String,
}

impl CrmClient {
    pub fn new(
        http: ResilientClient,
        sender_actor_id: Option<String>,
        pipeline: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        Self {
            http,
            sender_actor_id,
            pipeline: pipeline.into(),
            stage: stage.into(),
        }
    }

    fn reply_body(&self, target: &ReplyTarget, text: &str, mode: ReplyMode) -> serde_json::Value {
        let mut body = json!({ "type": mode.wire_type(), "text": text });
        if let Some(actor) = &self.sender_actor_id {
            body["senderActorId"] = json!(actor);
        }
        if mode == ReplyMode::Message {
            if let Some(channel) = &target.channel_id {
                body["channelId"] = json!(channel);
            }
            if let Some(account) = &target.channel_account_id {
                body["channelAccountId"] = json!(account);
            }
        }
        body
    }
}

#[async_trait]
impl ConversationPlatform for CrmClient {
    async fn fetch_message(
        &self,
        thread_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MessageDetail, CallError> {
        let path = format!(
            "/conversations/v3/conversations/threads/{}/messages/{}",
            path_segment(thread_id)?,
            path_segment(message_id)?
        );
        self.http.get_json(&path, cancel).await
    }

    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        mode: ReplyMode,
        cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        // 没有渠道信息时无法对外发消息，退化为内部备注
        let mode = if mode == ReplyMode::Message && target.channel_id.is_none() {
            tracing::warn!(
                thread_id = %target.thread_id,
                "No channel on reply target, posting as comment"
            );
            ReplyMode::Comment
        } else {
            mode
        };
        let path = format!(
            "/conversations/v3/conversations/threads/{}/messages",
            path_segment(&target.thread_id)?
        );
        for chunk in chunk_text(text, MAX_REPLY_CHARS) {
            let body = self.reply_body(target, &chunk, mode);
            let _: serde_json::Value = self.http.post_json(&path, &body, cancel).await?;
        }
        Ok(())
    }

    async fn create_ticket(
        &self,
        ticket: &NewTicket,
        cancel: &CancellationToken,
    ) -> Result<TicketRef, CallError> {
        let mut properties = json!({
            "hs_pipeline": self.pipeline,
            "hs_pipeline_stage": self.stage,
            "subject": ticket.subject,
            "content": ticket.content,
        });
        if let Some(priority) = &ticket.priority {
            properties["hs_ticket_priority"] = json!(priority);
        }
        let body = json!({
            "properties": properties,
            "associations": [{
                "to": { "id": ticket.thread_id },
                "types": [{
                    "associationCategory": "HUBSPOT_DEFINED",
                    "associationTypeId": TICKET_TO_THREAD_ASSOCIATION,
                }],
            }],
        });
        let created: TicketRef = self
            .http
            .post_json("/crm/v3/objects/tickets", &body, cancel)
            .await?;
        tracing::info!(ticket_id = %created.id, thread_id = %ticket.thread_id, "Ticket created");
        Ok(created)
    }
}
