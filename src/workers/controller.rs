//! Controller：唯一面向用户、负责分派的 Worker
//!
//! 每次 act 把会话日志映射为 chat 消息：用户 → user，自身 → assistant，
//! 专家结果与系统事件 → system（只作为上下文，不会原样出现在回复中）。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{HiveError, Message, MessageKind, Roster, TurnContext, Worker, USER_SOURCE};
use crate::llm::{ChatMessage, LlmClient};

/// 默认提示词：列出专家与委派 / 完成协议
pub fn controller_prompt(roster: &Roster, markers: &[String]) -> String {
    let mut prompt = format!(
        "You are {}, a customer support coordinator. You are the only one who talks to the customer.\n\n",
        roster.controller_name()
    );
    prompt.push_str("Specialists you can delegate to:\n");
    for spec in roster.specialists() {
        prompt.push_str(&format!("- {}: {}\n", spec.name, spec.description));
    }
    prompt.push_str(
        "\nTo delegate, put the delegation on its own line as `<SpecialistName> : instruction`, \
         including every detail the specialist needs (SKU, quantity, tracking number, issue summary). \
         Delegate to one specialist at a time and wait for its result.\n\
         Otherwise, answer the customer directly in plain language. Never paste raw specialist output.\n",
    );
    if let [done, rest @ ..] = markers {
        prompt.push_str(&format!(
            "When the customer's request is fully resolved, end your reply with {done}."
        ));
        if let Some(failed) = rest.first() {
            prompt.push_str(&format!(" If it cannot be resolved, end your reply with {failed}."));
        }
        prompt.push('\n');
    }
    prompt
}

pub struct ControllerWorker {
    name: String,
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl ControllerWorker {
    pub fn new(name: impl Into<String>, llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    fn to_chat(&self, log: &[Message]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(log.len() + 1);
        messages.push(ChatMessage::system(&self.system_prompt));
        for msg in log {
            if msg.source == USER_SOURCE {
                messages.push(ChatMessage::user(msg.as_text()));
            } else if msg.source == self.name {
                messages.push(ChatMessage::assistant(msg.as_text()));
            } else if msg.kind == MessageKind::SystemEvent {
                messages.push(ChatMessage::system(format!("[system] {}", msg.as_text())));
            } else {
                messages.push(ChatMessage::system(format!(
                    "[{} result] {}",
                    msg.source,
                    msg.as_text()
                )));
            }
        }
        messages
    }
}

#[async_trait]
impl Worker for ControllerWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, log: &[Message], ctx: &TurnContext) -> Result<Message, HiveError> {
        let messages = self.to_chat(log);
        tracing::debug!(
            conversation_id = %ctx.conversation_id,
            worker = %self.name,
            context_messages = messages.len(),
            "Controller thinking"
        );
        let reply = self.llm.complete(&messages).await?;
        let (_, _, total_tokens) = self.llm.token_usage();
        tracing::debug!(worker = %self.name, total_tokens, "Controller replied");
        Ok(Message::text(&self.name, reply.trim()))
    }
}
