//! 实时通知：按会话推送“处理中 / 处理完成”
//!
//! 状态单调且幂等：每个会话维护进行中的轮次计数，
//! 0 → 1 时广播 ProcessingStarted，回到 0 时广播 ProcessingStopped；
//! 新订阅者会立即拿到当前状态，不会因为错过广播而停留在过期的“处理中”。

pub mod server;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub use server::{serve_notifications, ClientFrame, ServerFrame};

const CHANNEL_CAPACITY: usize = 16;

/// 控制信号（不携带内容）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    ProcessingStarted,
    ProcessingStopped,
}

struct Channel {
    active: usize,
    tx: broadcast::Sender<Signal>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { active: 0, tx }
    }

    fn status(&self) -> Signal {
        if self.active > 0 {
            Signal::ProcessingStarted
        } else {
            Signal::ProcessingStopped
        }
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.tx.receiver_count() == 0
    }
}

/// 一个会话上的订阅
pub struct Subscription {
    pub conversation_id: String,
    /// 订阅时的状态
    pub current: Signal,
    receiver: broadcast::Receiver<Signal>,
}

impl Subscription {
    /// 下一个信号；落后时跳过旧信号
    pub async fn recv(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// 进行中的一轮；drop 时计数减一（保证“处理完成”一定会发出）
pub struct ActiveTurn {
    hub: Arc<NotificationHub>,
    conversation_id: String,
    /// 开始时是否有实时订阅者；没有则调用方需要先同步发送确认回复
    pub had_subscribers: bool,
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.hub.finish(&self.conversation_id);
    }
}

/// 按会话 ID 管理订阅与状态
#[derive(Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<String, Channel>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn subscribe(&self, conversation_id: &str) -> Subscription {
        let mut channels = self.channels();
        let channel = channels
            .entry(conversation_id.to_string())
            .or_insert_with(Channel::new);
        Subscription {
            conversation_id: conversation_id.to_string(),
            current: channel.status(),
            receiver: channel.tx.subscribe(),
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let conversation_id = subscription.conversation_id.clone();
        drop(subscription);
        let mut channels = self.channels();
        if channels.get(&conversation_id).is_some_and(Channel::is_idle) {
            channels.remove(&conversation_id);
        }
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.channels()
            .get(conversation_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn status(&self, conversation_id: &str) -> Signal {
        self.channels()
            .get(conversation_id)
            .map(Channel::status)
            .unwrap_or(Signal::ProcessingStopped)
    }

    /// 标记一轮开始；首个进行中的轮次广播 ProcessingStarted
    pub fn begin(self: &Arc<Self>, conversation_id: &str) -> ActiveTurn {
        let had_subscribers = {
            let mut channels = self.channels();
            let channel = channels
                .entry(conversation_id.to_string())
                .or_insert_with(Channel::new);
            channel.active += 1;
            if channel.active == 1 {
                let _ = channel.tx.send(Signal::ProcessingStarted);
            }
            channel.tx.receiver_count() > 0
        };
        tracing::debug!(
            conversation_id = %conversation_id,
            had_subscribers,
            "Processing started"
        );
        ActiveTurn {
            hub: Arc::clone(self),
            conversation_id: conversation_id.to_string(),
            had_subscribers,
        }
    }

    fn finish(&self, conversation_id: &str) {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(conversation_id) else {
            return;
        };
        channel.active = channel.active.saturating_sub(1);
        if channel.active == 0 {
            let _ = channel.tx.send(Signal::ProcessingStopped);
            tracing::debug!(conversation_id = %conversation_id, "Processing stopped");
        }
        if channel.is_idle() {
            channels.remove(conversation_id);
        }
    }
}
