//! 外部集成：会话平台（CRM）、报价、物流
//!
//! 所有出站调用都经过 `http::ResilientClient`（Bearer 鉴权、401 刷新后重试一次、错误分类）。

pub mod crm;
pub mod pricing;
pub mod shipment;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::http::CallError;

pub use crm::{
    CrmClient, MessageDetail, MessageSender, NewTicket, ReplyMode, ReplyTarget, TicketRef,
};
pub use pricing::{PricingClient, Quote};
pub use shipment::{ShipmentClient, ShipmentStatus};

/// 单条回复的最大字符数，超出后拆分为多条
pub const MAX_REPLY_CHARS: usize = 4000;

/// 会话平台契约：读取消息详情、回复、创建工单
#[async_trait]
pub trait ConversationPlatform: Send + Sync {
    async fn fetch_message(
        &self,
        thread_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MessageDetail, CallError>;

    /// 发送回复；过长的文本按 `MAX_REPLY_CHARS` 拆分
    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        mode: ReplyMode,
        cancel: &CancellationToken,
    ) -> Result<(), CallError>;

    async fn create_ticket(
        &self,
        ticket: &NewTicket,
        cancel: &CancellationToken,
    ) -> Result<TicketRef, CallError>;
}

/// 按字符数拆分长文本（不会切断 UTF-8 字符）
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

static SEGMENT_RE: OnceLock<Regex> = OnceLock::new();

/// 校验可以直接拼进 URL 路径的标识（SKU、运单号、线程 ID 等）
pub(crate) fn path_segment(value: &str) -> Result<&str, CallError> {
    let re = SEGMENT_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,128}$").expect("valid segment regex"));
    if re.is_match(value) {
        Ok(value)
    } else {
        Err(CallError::BadRequest {
            status: 400,
            body: format!("invalid identifier '{value}'"),
        })
    }
}
