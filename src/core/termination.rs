//! 轮次终止判定
//!
//! 满足任一条件即结束本轮（含触发条件的那条消息）：
//! - (a) 本轮消息数达到上限（硬上限）
//! - (b) controller 最新消息含完成 / 失败标记
//! - (c) 发言者选择返回 Defer（等待新的外部输入，最常见的正常结束）

use std::fmt;

use super::message::Message;
use super::selector::Route;

pub const DEFAULT_MAX_MESSAGES: usize = 30;

/// 默认完成 / 失败标记
pub fn default_markers() -> Vec<String> {
    vec!["[DONE]".to_string(), "[FAILED]".to_string()]
}

/// 本轮结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxMessages(usize),
    Marker(String),
    Deferred,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxMessages(n) => write!(f, "max_messages:{n}"),
            StopReason::Marker(m) => write!(f, "marker:{m}"),
            StopReason::Deferred => write!(f, "deferred"),
        }
    }
}

/// 终止判定器
#[derive(Debug, Clone)]
pub struct TerminationDetector {
    max_messages: usize,
    markers: Vec<String>,
}

impl Default for TerminationDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, default_markers())
    }
}

impl TerminationDetector {
    /// 上限至少为 1，空标记会被忽略
    pub fn new(max_messages: usize, markers: Vec<String>) -> Self {
        Self {
            max_messages: max_messages.max(1),
            markers: markers.into_iter().filter(|m| !m.is_empty()).collect(),
        }
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// `turn_len` 为本轮已追加的消息数（含用户输入）；按 (a) → (b) → (c) 顺序判定
    pub fn evaluate(
        &self,
        log: &[Message],
        turn_len: usize,
        route: &Route,
        controller: &str,
    ) -> Option<StopReason> {
        if turn_len >= self.max_messages {
            return Some(StopReason::MaxMessages(self.max_messages));
        }
        if let Some(marker) = self.marker_in(log.last(), controller) {
            return Some(StopReason::Marker(marker));
        }
        if *route == Route::Defer {
            return Some(StopReason::Deferred);
        }
        None
    }

    fn marker_in(&self, last: Option<&Message>, controller: &str) -> Option<String> {
        let last = last?;
        if last.source != controller {
            return None;
        }
        let text = last.content.text()?;
        self.markers
            .iter()
            .find(|m| text.contains(m.as_str()))
            .cloned()
    }

    /// 去掉用户可见回复中的标记
    pub fn strip_markers(&self, text: &str) -> String {
        let mut out = text.to_string();
        for marker in &self.markers {
            out = out.replace(marker.as_str(), "");
        }
        out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLLER: &str = "Coordinator";

    #[test]
    fn test_cap_wins_first() {
        let detector = TerminationDetector::new(3, default_markers());
        let log = vec![Message::text(CONTROLLER, "<PricingWorker> : go")];
        let route = Route::ToWorker("PricingWorker".into());
        assert_eq!(detector.evaluate(&log, 2, &route, CONTROLLER), None);
        assert_eq!(
            detector.evaluate(&log, 3, &route, CONTROLLER),
            Some(StopReason::MaxMessages(3))
        );
    }

    #[test]
    fn test_marker_only_counts_for_controller() {
        let detector = TerminationDetector::default();
        let route = Route::ToWorker(CONTROLLER.into());

        let from_controller = vec![Message::text(CONTROLLER, "All set. [DONE]")];
        assert_eq!(
            detector.evaluate(&from_controller, 2, &route, CONTROLLER),
            Some(StopReason::Marker("[DONE]".into()))
        );

        let from_user = vec![Message::user("[DONE]")];
        assert_eq!(detector.evaluate(&from_user, 1, &route, CONTROLLER), None);

        let from_specialist = vec![Message::text("PricingWorker", "[FAILED]")];
        assert_eq!(detector.evaluate(&from_specialist, 2, &route, CONTROLLER), None);
    }

    #[test]
    fn test_defer_terminates() {
        let detector = TerminationDetector::default();
        let log = vec![Message::text(CONTROLLER, "Anything else?")];
        assert_eq!(
            detector.evaluate(&log, 2, &Route::Defer, CONTROLLER),
            Some(StopReason::Deferred)
        );
    }

    #[test]
    fn test_cap_is_at_least_one() {
        let detector = TerminationDetector::new(0, vec![]);
        assert_eq!(detector.max_messages(), 1);
        let log = vec![Message::user("hi")];
        assert_eq!(
            detector.evaluate(&log, 1, &Route::ToWorker(CONTROLLER.into()), CONTROLLER),
            Some(StopReason::MaxMessages(1))
        );
    }

    #[test]
    fn test_strip_markers() {
        let detector = TerminationDetector::default();
        assert_eq!(detector.strip_markers("Your order shipped. [DONE]"), "Your order shipped.");
        assert_eq!(StopReason::Marker("[DONE]".into()).to_string(), "marker:[DONE]");
        assert_eq!(StopReason::MaxMessages(30).to_string(), "max_messages:30");
    }
}
