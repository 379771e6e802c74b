//! Webhook 流水线：重复投递去重、无关消息过滤、失败后可重投、确认回复与通知

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::core::{
    default_roster_specs, HiveError, Message, OrchestratorSettings, Roster, ShutdownManager,
    TerminationDetector, TurnContext, TurnOrchestrator, Worker, WorkerFactory, WorkerSpec,
};
use hive::http::CallError;
use hive::integrations::{
    ConversationPlatform, MessageDetail, NewTicket, ReplyMode, ReplyTarget, TicketRef,
};
use hive::notify::{NotificationHub, Signal};
use hive::store::MemorySessionStore;
use hive::webhook::{DedupGuard, WebhookNotification, WebhookPipeline};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const ACK: &str = "Got it, working on it.";

/// controller 每次被调用计数一次，然后直接回答
struct CountingController {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for CountingController {
    fn name(&self) -> &str {
        "Coordinator"
    }

    async fn act(&mut self, log: &[Message], _ctx: &TurnContext) -> Result<Message, HiveError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let question = log.last().map(|m| m.as_text()).unwrap_or_default();
        Ok(Message::text("Coordinator", format!("Answer to: {question} [DONE]")))
    }
}

struct Factory {
    runs: Arc<AtomicUsize>,
}

impl WorkerFactory for Factory {
    fn build(&self, spec: &WorkerSpec, _roster: &Roster) -> Result<Box<dyn Worker>, HiveError> {
        if spec.name != "Coordinator" {
            return Err(HiveError::Config(format!("unexpected worker {}", spec.name)));
        }
        Ok(Box::new(CountingController {
            runs: self.runs.clone(),
        }))
    }
}

/// 内存中的会话平台：消息详情由 sender 决定，回复全部记录
#[derive(Default)]
struct FakePlatform {
    fetches: AtomicUsize,
    fail_fetches: AtomicUsize,
    sender: Mutex<String>,
    replies: Mutex<Vec<(ReplyTarget, String)>>,
}

impl FakePlatform {
    fn new(sender: &str) -> Self {
        let platform = Self::default();
        *platform.sender.lock().unwrap() = sender.to_string();
        platform
    }

    fn replies(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ConversationPlatform for FakePlatform {
    async fn fetch_message(
        &self,
        _thread_id: &str,
        message_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<MessageDetail, CallError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CallError::Server {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let sender = self.sender.lock().unwrap().clone();
        Ok(serde_json::from_value(json!({
            "id": message_id,
            "type": "MESSAGE",
            "direction": "INCOMING",
            "text": format!("question {message_id}"),
            "senders": [{ "actorId": sender }],
            "channelId": "1000",
            "channelAccountId": "42"
        }))
        .unwrap())
    }

    async fn post_reply(
        &self,
        target: &ReplyTarget,
        text: &str,
        _mode: ReplyMode,
        _cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        self.replies
            .lock()
            .unwrap()
            .push((target.clone(), text.to_string()));
        Ok(())
    }

    async fn create_ticket(
        &self,
        _ticket: &NewTicket,
        _cancel: &CancellationToken,
    ) -> Result<TicketRef, CallError> {
        Ok(TicketRef {
            id: "T-1".to_string(),
        })
    }
}

struct Harness {
    pipeline: Arc<WebhookPipeline>,
    platform: Arc<FakePlatform>,
    hub: Arc<NotificationHub>,
    runs: Arc<AtomicUsize>,
}

fn harness(platform: FakePlatform) -> Harness {
    let runs = Arc::new(AtomicUsize::new(0));
    let roster = Roster::new(
        default_roster_specs()
            .into_iter()
            .filter(|s| s.name == "Coordinator" || s.name == "user")
            .collect(),
    )
    .unwrap();
    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(MemorySessionStore::new()),
        roster,
        Arc::new(Factory { runs: runs.clone() }),
        TerminationDetector::default(),
        OrchestratorSettings::default(),
    ));
    let platform = Arc::new(platform);
    let hub = Arc::new(NotificationHub::new());
    let pipeline = Arc::new(
        WebhookPipeline::new(
            orchestrator,
            platform.clone(),
            hub.clone(),
            DedupGuard::in_memory(Duration::from_secs(60)),
            Arc::new(ShutdownManager::new()),
        )
        .with_ack_reply(ACK),
    );
    Harness {
        pipeline,
        platform,
        hub,
        runs,
    }
}

fn notification(thread: u64, message_id: &str) -> WebhookNotification {
    serde_json::from_value(json!({
        "eventId": 1,
        "subscriptionType": "conversation.newMessage",
        "objectId": thread,
        "messageId": message_id,
        "messageType": "MESSAGE"
    }))
    .unwrap()
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_duplicate_delivery_runs_once_and_replies_once() {
    let h = harness(FakePlatform::new("V-100"));

    let first = h
        .pipeline
        .accept_batch(vec![notification(7, "m-1"), notification(7, "m-1")]);
    let second = h.pipeline.accept_batch(vec![notification(7, "m-1")]);
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    join_all(first).await;

    // 处理完成后的迟到重投同样是 no-op
    assert!(h.pipeline.accept_batch(vec![notification(7, "m-1")]).is_empty());

    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    let replies = h.platform.replies();
    assert_eq!(replies, vec![ACK.to_string(), "Answer to: question m-1".to_string()]);
    let targets = h.platform.replies.lock().unwrap();
    assert_eq!(targets[1].0.thread_id, "7");
    assert_eq!(targets[1].0.channel_id.as_deref(), Some("1000"));
}

#[tokio::test]
async fn test_non_visitor_messages_are_ignored() {
    let h = harness(FakePlatform::new("A-agent"));
    join_all(h.pipeline.accept_batch(vec![notification(7, "m-echo")])).await;

    assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    assert!(h.platform.replies().is_empty());
    // 已判定无关的消息不会被重复拉取
    assert!(h.pipeline.accept_batch(vec![notification(7, "m-echo")]).is_empty());
}

#[tokio::test]
async fn test_unsubscribed_types_and_missing_ids_are_skipped() {
    let h = harness(FakePlatform::new("V-100"));
    let other: WebhookNotification = serde_json::from_value(json!({
        "eventId": 2,
        "subscriptionType": "conversation.creation",
        "objectId": 7
    }))
    .unwrap();
    let no_message: WebhookNotification = serde_json::from_value(json!({
        "eventId": 3,
        "subscriptionType": "conversation.newMessage",
        "objectId": 7
    }))
    .unwrap();
    assert!(h.pipeline.accept_batch(vec![other, no_message]).is_empty());
    assert_eq!(h.platform.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_fetch_allows_redelivery() {
    let platform = FakePlatform::new("V-100");
    platform.fail_fetches.store(1, Ordering::SeqCst);
    let h = harness(platform);

    join_all(h.pipeline.accept_batch(vec![notification(7, "m-2")])).await;
    assert_eq!(h.runs.load(Ordering::SeqCst), 0);
    assert_eq!(h.pipeline.in_flight(), 0);

    join_all(h.pipeline.accept_batch(vec![notification(7, "m-2")])).await;
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    assert_eq!(h.platform.replies().len(), 2);
}

#[tokio::test]
async fn test_live_subscriber_gets_signals_instead_of_ack() {
    let h = harness(FakePlatform::new("V-100"));
    let mut subscription = h.hub.subscribe("7");
    assert_eq!(subscription.current, Signal::ProcessingStopped);

    join_all(h.pipeline.accept_batch(vec![notification(7, "m-3")])).await;

    assert_eq!(subscription.recv().await, Some(Signal::ProcessingStarted));
    assert_eq!(subscription.recv().await, Some(Signal::ProcessingStopped));
    assert_eq!(h.platform.replies(), vec!["Answer to: question m-3".to_string()]);
}
