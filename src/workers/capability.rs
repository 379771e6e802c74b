//! 专家能力：报价查询、物流查询、创建工单
//!
//! 每个 specialist 绑定一个 Capability（name / description / 参数 schema / 异步调用）。
//! 调用失败不会抛出，而是由 [`invoke_audited`] 转为结构化的错误结果交回 controller。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::TurnContext;
use crate::http::CallError;
use crate::integrations::{ConversationPlatform, NewTicket, PricingClient, ShipmentClient};

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error(transparent)]
    External(#[from] CallError),
}

impl CapabilityError {
    fn label(&self) -> &'static str {
        match self {
            CapabilityError::InvalidArgs(_) => "invalid_args",
            CapabilityError::External(e) => e.outcome(),
        }
    }
}

/// 能力契约
#[async_trait]
pub trait Capability: Send + Sync {
    /// Tool Call JSON 中的 "tool" 字段
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value;

    async fn invoke(&self, args: Value, ctx: &TurnContext) -> Result<Value, CapabilityError>;
}

/// 调用能力并输出审计日志；结果统一包装为 `{"tool", "ok", "result" | "error"}`
pub async fn invoke_audited(capability: &dyn Capability, args: Value, ctx: &TurnContext) -> Value {
    let start = Instant::now();
    let tool = capability.name().to_string();
    let result = capability.invoke(args.clone(), ctx).await;

    let audit = json!({
        "event": "capability_audit",
        "tool": tool,
        "conversation_id": ctx.conversation_id,
        "ok": result.is_ok(),
        "outcome": result.as_ref().err().map(|e| e.label()).unwrap_or("ok"),
        "duration_ms": start.elapsed().as_millis() as u64,
    });
    tracing::info!(audit = %audit.to_string(), "capability");

    match result {
        Ok(value) => json!({ "tool": tool, "args": args, "ok": true, "result": value }),
        Err(e) => json!({
            "tool": tool,
            "args": args,
            "ok": false,
            "error": e.label(),
            "detail": e.to_string(),
        }),
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CapabilityError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CapabilityError::InvalidArgs(format!("'{key}' is required")))
}

/// 报价查询：`{"sku": "...", "quantity": 1}`
pub struct PricingLookup {
    client: Arc<PricingClient>,
}

impl PricingLookup {
    pub fn new(client: Arc<PricingClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for PricingLookup {
    fn name(&self) -> &str {
        "price_lookup"
    }

    fn description(&self) -> &str {
        "Look up unit price, availability and lead time for a product SKU."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sku": { "type": "string" },
                "quantity": { "type": "integer", "minimum": 1 }
            },
            "required": ["sku"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &TurnContext) -> Result<Value, CapabilityError> {
        let sku = required_str(&args, "sku")?;
        let quantity = match args.get("quantity") {
            None | Some(Value::Null) => 1,
            Some(v) => v
                .as_u64()
                .and_then(|q| u32::try_from(q).ok())
                .filter(|q| *q > 0)
                .ok_or_else(|| {
                    CapabilityError::InvalidArgs("'quantity' must be a positive integer".into())
                })?,
        };
        let quote = self.client.quote(sku, quantity, &ctx.cancel).await?;
        Ok(json!({
            "sku": quote.sku,
            "unit_price": quote.unit_price,
            "currency": quote.currency,
            "quantity": quote.quantity,
            "total": quote.total(),
            "available": quote.available,
            "lead_time_days": quote.lead_time_days,
        }))
    }
}

/// 物流查询：`{"tracking_number": "..."}`
pub struct ShipmentLookup {
    client: Arc<ShipmentClient>,
}

impl ShipmentLookup {
    pub fn new(client: Arc<ShipmentClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Capability for ShipmentLookup {
    fn name(&self) -> &str {
        "shipment_status"
    }

    fn description(&self) -> &str {
        "Look up the current delivery status of a shipment by tracking number."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "tracking_number": { "type": "string" } },
            "required": ["tracking_number"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &TurnContext) -> Result<Value, CapabilityError> {
        let tracking = required_str(&args, "tracking_number")?;
        let status = self.client.status(tracking, &ctx.cancel).await?;
        serde_json::to_value(status).map_err(|e| CapabilityError::InvalidArgs(e.to_string()))
    }
}

/// 创建工单，并关联到当前会话（会话 ID 取自 TurnContext）
pub struct CreateTicket {
    platform: Arc<dyn ConversationPlatform>,
}

impl CreateTicket {
    pub fn new(platform: Arc<dyn ConversationPlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Capability for CreateTicket {
    fn name(&self) -> &str {
        "create_ticket"
    }

    fn description(&self) -> &str {
        "Open a support ticket for a human agent, linked to the current conversation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subject": { "type": "string" },
                "content": { "type": "string" },
                "priority": { "type": "string", "enum": ["LOW", "MEDIUM", "HIGH"] }
            },
            "required": ["subject", "content"]
        })
    }

    async fn invoke(&self, args: Value, ctx: &TurnContext) -> Result<Value, CapabilityError> {
        let ticket = NewTicket {
            subject: required_str(&args, "subject")?.to_string(),
            content: required_str(&args, "content")?.to_string(),
            thread_id: ctx.conversation_id.clone(),
            priority: args
                .get("priority")
                .and_then(Value::as_str)
                .map(|p| p.to_uppercase()),
        };
        let created = self.platform.create_ticket(&ticket, &ctx.cancel).await?;
        Ok(json!({ "ticket_id": created.id }))
    }
}
