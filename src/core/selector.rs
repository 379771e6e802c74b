//! 发言者选择：纯函数、确定性
//!
//! 按顺序匹配，首条命中即返回：
//! 1. 日志为空 → controller
//! 2. 最后一条来自用户 → controller
//! 3. 最后一条来自 specialist → controller
//! 4. 最后一条来自 controller → 解析委派标记 `<Name> : ...`：
//!    命中 specialist 则交给它；名字未知则回到 controller 自我纠正；无标记则 Defer
//! 5. 其它 → Defer
//!
//! 拓扑始终是星型（controller ↔ specialists），specialist 之间不会直接对话。

use std::sync::OnceLock;

use regex::Regex;

use super::message::Message;
use super::worker::Roster;

/// 选择结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// 由指定 Worker 发言
    ToWorker(String),
    /// 无确定性路由：本轮结束，等待新的外部输入（合法终态，不是错误）
    Defer,
}

static DELEGATION_RE: OnceLock<Regex> = OnceLock::new();

fn delegation_re() -> &'static Regex {
    DELEGATION_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*<([A-Za-z][A-Za-z0-9_\-]*)>\s*:").expect("valid delegation regex")
    })
}

/// 提取 controller 文本中第一条委派标记的目标名（按行首匹配 `<Name> :`）
pub fn parse_delegation(content: &str) -> Option<&str> {
    delegation_re()
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// 委派标记之后的指令正文；无标记时返回全文
pub fn delegation_instruction(content: &str) -> &str {
    match delegation_re().find(content) {
        Some(m) => content[m.end()..].trim(),
        None => content.trim(),
    }
}

/// 委派标记之前、可以给用户看的部分；无标记时返回全文
pub fn user_visible_part(content: &str) -> &str {
    match delegation_re().find(content) {
        Some(m) => content[..m.start()].trim(),
        None => content.trim(),
    }
}

/// 根据日志选择下一个发言者
pub fn select(log: &[Message], roster: &Roster) -> Route {
    let controller = roster.controller_name();
    let Some(last) = log.last() else {
        return Route::ToWorker(controller.to_string());
    };

    if last.is_user() || roster.is_specialist(&last.source) {
        return Route::ToWorker(controller.to_string());
    }

    if last.source == controller {
        let Some(text) = last.content.text() else {
            return Route::Defer;
        };
        return match parse_delegation(text) {
            Some(target) if roster.is_specialist(target) => Route::ToWorker(target.to_string()),
            Some(_) => Route::ToWorker(controller.to_string()),
            None => Route::Defer,
        };
    }

    Route::Defer
}
