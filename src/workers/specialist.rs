//! Specialist：把 controller 的委派指令转成一次能力调用
//!
//! 流程：取最近一条 controller 委派 → LLM 生成 `{"tool": ..., "args": {...}}` →
//! 调用绑定的 Capability → 返回 ToolResult 消息。
//! 最近一次结果作为私有记忆随快照保存，下一轮可用于“再查一次同样的单号”之类的追问。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::selector::delegation_instruction;
use crate::core::{HiveError, Message, TurnContext, Worker};
use crate::llm::{ChatMessage, LlmClient};

use super::capability::{invoke_audited, Capability};

/// LLM 输出的能力调用（简化 JSON：{"tool": "price_lookup", "args": {"sku": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// 从 LLM 文本中提取 Tool Call（支持 ```json 代码块或裸 JSON）
pub fn parse_tool_call(output: &str) -> Result<ToolCall, String> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let Some(body) = trimmed
        .find('{')
        .zip(trimmed.rfind('}'))
        .filter(|(start, end)| start < end)
        .and_then(|(start, end)| trimmed.get(start..=end))
    {
        body
    } else {
        return Err(format!("no JSON tool call in output: {trimmed}"));
    };

    let parsed: ToolCall =
        serde_json::from_str(json_str).map_err(|e| format!("{}: {}", e, json_str))?;
    if parsed.tool.is_empty() {
        return Err("tool call without tool name".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SpecialistMemory {
    last_result: Option<Value>,
}

pub struct SpecialistWorker {
    name: String,
    controller: String,
    llm: Arc<dyn LlmClient>,
    capability: Arc<dyn Capability>,
    memory: SpecialistMemory,
}

impl SpecialistWorker {
    pub fn new(
        name: impl Into<String>,
        controller: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        capability: Arc<dyn Capability>,
    ) -> Self {
        Self {
            name: name.into(),
            controller: controller.into(),
            llm,
            capability,
            memory: SpecialistMemory::default(),
        }
    }

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are {}, a back-office specialist. You have exactly one tool.\n\n\
             Tool: {}\nDescription: {}\nParameters (JSON Schema): {}\n\n\
             Turn the instruction into a single tool call. Respond with JSON only:\n\
             {{\"tool\": \"{}\", \"args\": {{...}}}}\n",
            self.name,
            self.capability.name(),
            self.capability.description(),
            self.capability.parameters_schema(),
            self.capability.name(),
        );
        if let Some(last) = &self.memory.last_result {
            prompt.push_str(&format!("\nYour previous result, for reference: {last}\n"));
        }
        prompt
    }

    /// 最近一条 controller 消息中的委派指令
    fn instruction<'a>(&self, log: &'a [Message]) -> Option<&'a str> {
        log.iter()
            .rev()
            .find(|m| m.is_from(&self.controller))
            .and_then(|m| m.content.text())
            .map(delegation_instruction)
            .filter(|s| !s.is_empty())
    }
}

#[async_trait]
impl Worker for SpecialistWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, log: &[Message], ctx: &TurnContext) -> Result<Message, HiveError> {
        let Some(instruction) = self.instruction(log) else {
            return Ok(Message::tool_result(
                &self.name,
                json!({
                    "tool": self.capability.name(),
                    "ok": false,
                    "error": "missing_instruction",
                    "detail": "no delegation instruction found",
                }),
            ));
        };

        let messages = vec![
            ChatMessage::system(self.system_prompt()),
            ChatMessage::user(instruction),
        ];
        let output = self.llm.complete(&messages).await?;

        let payload = match parse_tool_call(&output) {
            Ok(call) if call.tool == self.capability.name() => {
                invoke_audited(self.capability.as_ref(), call.args, ctx).await
            }
            Ok(call) => json!({
                "tool": self.capability.name(),
                "ok": false,
                "error": "unknown_tool",
                "detail": format!("'{}' is not available to {}", call.tool, self.name),
            }),
            Err(detail) => {
                tracing::warn!(worker = %self.name, "Unparseable tool call: {}", detail);
                json!({
                    "tool": self.capability.name(),
                    "ok": false,
                    "error": "invalid_tool_call",
                    "detail": detail,
                })
            }
        };

        self.memory.last_result = Some(payload.clone());
        Ok(Message::tool_result(&self.name, payload))
    }

    fn export_memory(&self) -> Option<Value> {
        self.memory.last_result.as_ref()?;
        serde_json::to_value(&self.memory).ok()
    }

    fn import_memory(&mut self, memory: Value) -> Result<(), String> {
        self.memory = serde_json::from_value(memory).map_err(|e| e.to_string())?;
        Ok(())
    }
}
