//! 一轮编排的端到端场景：续接、委派、上限、存储故障、取消、快照续接等价

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hive::core::{
    default_roster_specs, HiveError, Message, OrchestratorSettings, Roster, StopReason,
    TerminationDetector, TurnContext, TurnOrchestrator, TurnRequest, Worker, WorkerFactory,
    WorkerSpec,
};
use hive::store::{MemorySessionStore, SessionStore, StoreError};
use tokio_util::sync::CancellationToken;

type Seen = Arc<Mutex<Vec<Vec<(String, String)>>>>;

/// 按脚本回复；脚本耗尽后重复最后一行。记录每次看到的日志
struct ScriptedWorker {
    name: String,
    lines: Arc<Mutex<VecDeque<String>>>,
    last: Option<String>,
    delay: Duration,
    seen: Seen,
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn act(&mut self, log: &[Message], _ctx: &TurnContext) -> Result<Message, HiveError> {
        self.seen.lock().unwrap().push(
            log.iter()
                .map(|m| (m.source.clone(), m.as_text()))
                .collect(),
        );
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let line = self.lines.lock().unwrap().pop_front();
        if let Some(line) = &line {
            self.last = Some(line.clone());
        }
        let line = line.or_else(|| self.last.clone()).unwrap_or_else(|| "ok".to_string());
        if line == "!fail" {
            return Err(HiveError::worker(&self.name, "scripted failure"));
        }
        Ok(Message::text(&self.name, line))
    }
}

#[derive(Default)]
struct Scripts {
    lines: HashMap<String, Arc<Mutex<VecDeque<String>>>>,
    delay: Duration,
    seen: HashMap<String, Seen>,
}

impl Scripts {
    fn with(mut self, worker: &str, lines: &[&str]) -> Self {
        self.lines.insert(
            worker.to_string(),
            Arc::new(Mutex::new(lines.iter().map(|l| l.to_string()).collect())),
        );
        self
    }

    fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn seen(&mut self, worker: &str) -> Seen {
        self.seen.entry(worker.to_string()).or_default().clone()
    }
}

impl WorkerFactory for Scripts {
    fn build(&self, spec: &WorkerSpec, _roster: &Roster) -> Result<Box<dyn Worker>, HiveError> {
        Ok(Box::new(ScriptedWorker {
            name: spec.name.clone(),
            lines: self.lines.get(&spec.name).cloned().unwrap_or_default(),
            last: None,
            delay: self.delay,
            seen: self.seen.get(&spec.name).cloned().unwrap_or_default(),
        }))
    }
}

fn orchestrator(scripts: Scripts, store: Arc<dyn SessionStore>) -> TurnOrchestrator {
    orchestrator_with(scripts, store, OrchestratorSettings::default())
}

fn orchestrator_with(
    scripts: Scripts,
    store: Arc<dyn SessionStore>,
    settings: OrchestratorSettings,
) -> TurnOrchestrator {
    TurnOrchestrator::new(
        store,
        Roster::new(default_roster_specs()).unwrap(),
        Arc::new(scripts),
        TerminationDetector::default(),
        settings,
    )
}

fn sources(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.source.as_str()).collect()
}

fn assert_no_repeated_speaker(messages: &[Message]) {
    for pair in messages.windows(2) {
        assert_ne!(pair[0].source, pair[1].source, "consecutive speaker repeated");
    }
}

/// load 失败、save 成功的存储
struct FlakyStore {
    inner: MemorySessionStore,
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn load(&self, _conversation_id: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn save(&self, conversation_id: &str, snapshot: &str) -> Result<(), StoreError> {
        self.inner.save(conversation_id, snapshot).await
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.inner.delete(conversation_id).await
    }
}

/// load 正常、save 总是失败的存储
#[derive(Default)]
struct ReadOnlyStore {
    inner: MemorySessionStore,
    deleted: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionStore for ReadOnlyStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.load(conversation_id).await
    }

    async fn save(&self, _conversation_id: &str, _snapshot: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.deleted.lock().unwrap().push(conversation_id.to_string());
        self.inner.delete(conversation_id).await
    }
}

#[tokio::test]
async fn test_follow_up_restores_previous_exchange() {
    let mut scripts = Scripts::default().with("Coordinator", &["Hi! How can I help?", "Sure."]);
    let seen = scripts.seen("Coordinator");
    let store = Arc::new(MemorySessionStore::new());
    let orch = orchestrator(scripts, store.clone());

    let first = orch
        .run_turn(TurnRequest::new("hello"), CancellationToken::new())
        .await
        .unwrap();
    assert!(first.conversation_id.starts_with("conv_"));
    assert_eq!(first.reply, "Hi! How can I help?");
    assert_eq!(first.stop_reason, StopReason::Deferred);
    assert!(store.load(&first.conversation_id).await.unwrap().is_some());

    let second = orch
        .run_turn(
            TurnRequest::new("what about shipping?").in_conversation(first.conversation_id.clone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(second.conversation_id, first.conversation_id);
    assert_eq!(second.reply, "Sure.");

    let seen = seen.lock().unwrap();
    let log = seen.last().unwrap();
    assert_eq!(
        log.iter().map(|(s, t)| (s.as_str(), t.as_str())).collect::<Vec<_>>(),
        vec![
            ("user", "hello"),
            ("Coordinator", "Hi! How can I help?"),
            ("user", "what about shipping?"),
        ]
    );
}

#[tokio::test]
async fn test_delegation_returns_to_controller() {
    let mut scripts = Scripts::default()
        .with(
            "Coordinator",
            &["Let me check.\n<PricingWorker> : price of SKU-1 x2", "Two units cost $10. [DONE]"],
        )
        .with("PricingWorker", &["{\"unit_price\": 5, \"quantity\": 2}"]);
    let pricing_seen = scripts.seen("PricingWorker");
    let orch = orchestrator(scripts, Arc::new(MemorySessionStore::new()));

    let outcome = orch
        .run_turn(TurnRequest::new("how much for two SKU-1?"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        sources(&outcome.turn_messages),
        vec!["user", "Coordinator", "PricingWorker", "Coordinator"]
    );
    assert_eq!(outcome.reply, "Two units cost $10.");
    assert!(!outcome.reply.contains("unit_price"));
    assert_eq!(outcome.stop_reason, StopReason::Marker("[DONE]".to_string()));
    assert_eq!(pricing_seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_endless_delegation_halts_at_cap() {
    let scripts = Scripts::default()
        .with("Coordinator", &["<ShipmentWorker> : check again"])
        .with("ShipmentWorker", &["still in transit"]);
    let orch = orchestrator(scripts, Arc::new(MemorySessionStore::new()));

    let outcome = orch
        .run_turn(TurnRequest::new("where is my parcel?"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::MaxMessages(30));
    assert_eq!(outcome.turn_messages.len(), 30);
    assert_no_repeated_speaker(&outcome.turn_messages);
    assert!(!outcome.reply.contains("<ShipmentWorker>"));
}

#[tokio::test]
async fn test_unknown_delegations_never_repeat_speaker() {
    let scripts = Scripts::default().with("Coordinator", &["<RefundWorker> : refund"]);
    let orch = orchestrator(scripts, Arc::new(MemorySessionStore::new()));

    let outcome = orch
        .run_turn(TurnRequest::new("refund"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.stop_reason, StopReason::MaxMessages(30));
    assert_no_repeated_speaker(&outcome.turn_messages);
}

#[tokio::test]
async fn test_store_load_failure_starts_fresh() {
    let store = Arc::new(FlakyStore {
        inner: MemorySessionStore::new(),
    });
    let scripts = Scripts::default().with("Coordinator", &["Hello there."]);
    let orch = orchestrator(scripts, store.clone());

    let outcome = orch
        .run_turn(
            TurnRequest::new("hello").in_conversation("conv_flaky"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.reply, "Hello there.");
    assert!(outcome.persist_error.is_none());
    assert_eq!(store.inner.len().await, 1);
}

#[tokio::test]
async fn test_corrupt_snapshot_is_discarded() {
    let store = Arc::new(MemorySessionStore::new());
    store.save("conv_bad", "{not json").await.unwrap();
    let orch = orchestrator(
        Scripts::default().with("Coordinator", &["Fresh start."]),
        store.clone(),
    );

    let outcome = orch
        .run_turn(
            TurnRequest::new("hi").in_conversation("conv_bad"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.reply, "Fresh start.");
    assert_eq!(outcome.turn_messages.len(), 2);
    let blob = store.load("conv_bad").await.unwrap().unwrap();
    assert!(blob.contains("Fresh start."));
}

#[tokio::test]
async fn test_corrupt_snapshot_is_deleted_even_when_save_fails() {
    let store = Arc::new(ReadOnlyStore::default());
    store.inner.save("conv_bad", "{not json").await.unwrap();
    let orch = orchestrator(
        Scripts::default().with("Coordinator", &["Fresh start."]),
        store.clone(),
    );

    let outcome = orch
        .run_turn(
            TurnRequest::new("hi").in_conversation("conv_bad"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.reply, "Fresh start.");
    assert_eq!(*store.deleted.lock().unwrap(), vec!["conv_bad".to_string()]);
    assert_eq!(store.inner.load("conv_bad").await.unwrap(), None);
}

#[tokio::test]
async fn test_save_failure_still_returns_reply() {
    let store = Arc::new(ReadOnlyStore::default());
    let orch = orchestrator(
        Scripts::default().with("Coordinator", &["Your order ships tomorrow. [DONE]"]),
        store.clone(),
    );

    let outcome = orch
        .run_turn(
            TurnRequest::new("when does it ship?").in_conversation("conv_ro"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.conversation_id, "conv_ro");
    assert_eq!(outcome.reply, "Your order ships tomorrow.");
    assert_eq!(outcome.stop_reason, StopReason::Marker("[DONE]".to_string()));
    let persist_error = outcome.persist_error.expect("save failure not reported");
    assert!(persist_error.contains("disk full"));
    assert!(store.inner.is_empty().await);
}

#[tokio::test]
async fn test_slow_worker_times_out_without_persisting() {
    let store = Arc::new(MemorySessionStore::new());
    let settings = OrchestratorSettings {
        worker_timeout: Duration::from_millis(20),
        ..OrchestratorSettings::default()
    };
    let orch = orchestrator_with(
        Scripts::default().slow(Duration::from_secs(5)),
        store.clone(),
        settings,
    );

    let failure = tokio::time::timeout(
        Duration::from_secs(2),
        orch.run_turn(
            TurnRequest::new("hello").in_conversation("conv_wt"),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("worker timeout was not enforced")
    .unwrap_err();
    assert_eq!(failure.conversation_id, "conv_wt");
    assert!(matches!(failure.error, HiveError::WorkerTimeout(ref name) if name == "Coordinator"));
    assert_eq!(failure.error.kind(), "timeout");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_turn_deadline_stops_endless_delegation() {
    let store = Arc::new(MemorySessionStore::new());
    let settings = OrchestratorSettings {
        worker_timeout: Duration::from_secs(1),
        turn_timeout: Duration::from_millis(100),
        ..OrchestratorSettings::default()
    };
    let scripts = Scripts::default()
        .with("Coordinator", &["<ShipmentWorker> : check again"])
        .with("ShipmentWorker", &["still in transit"])
        .slow(Duration::from_millis(30));
    let orch = orchestrator_with(scripts, store.clone(), settings);

    let failure = tokio::time::timeout(
        Duration::from_secs(2),
        orch.run_turn(
            TurnRequest::new("where is my parcel?").in_conversation("conv_tt"),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("turn deadline was not enforced")
    .unwrap_err();
    assert_eq!(failure.conversation_id, "conv_tt");
    assert!(matches!(failure.error, HiveError::TurnTimeout));
    assert_eq!(failure.error.kind(), "timeout");
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_failed_turn_keeps_previous_snapshot() {
    let store = Arc::new(MemorySessionStore::new());
    let orch = orchestrator(
        Scripts::default().with("Coordinator", &["First answer.", "!fail"]),
        store.clone(),
    );

    orch.run_turn(
        TurnRequest::new("one").in_conversation("conv_keep"),
        CancellationToken::new(),
    )
    .await
    .unwrap();
    let before = store.load("conv_keep").await.unwrap();

    let failure = orch
        .run_turn(
            TurnRequest::new("two").in_conversation("conv_keep"),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(failure.conversation_id, "conv_keep");
    assert_eq!(failure.error.kind(), "worker_failed");
    assert_eq!(store.load("conv_keep").await.unwrap(), before);
}

#[tokio::test]
async fn test_cancellation_aborts_promptly_without_persisting() {
    let store = Arc::new(MemorySessionStore::new());
    let orch = Arc::new(orchestrator(
        Scripts::default().slow(Duration::from_secs(30)),
        store.clone(),
    ));
    let cancel = CancellationToken::new();

    let task = {
        let orch = Arc::clone(&orch);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            orch.run_turn(TurnRequest::new("hello").in_conversation("conv_c"), cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("turn did not stop after cancellation")
        .unwrap();
    assert!(matches!(result.unwrap_err().error, HiveError::Cancelled));
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_restored_session_behaves_like_continued_one() {
    let script: &[&str] = &["Noted.", "You said hello before."];

    // 同一个编排器连续两轮
    let mut continued = Scripts::default().with("Coordinator", script);
    let continued_seen = continued.seen("Coordinator");
    let orch = orchestrator(continued, Arc::new(MemorySessionStore::new()));
    for text in ["hello", "what did I say?"] {
        orch.run_turn(
            TurnRequest::new(text).in_conversation("conv_eq"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    // 第二轮换一个全新的编排器，只共享存储
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let lines = Arc::new(Mutex::new(
        script.iter().map(|l| l.to_string()).collect::<VecDeque<_>>(),
    ));
    let mut restored_seen = None;
    for text in ["hello", "what did I say?"] {
        let mut scripts = Scripts::default();
        scripts.lines.insert("Coordinator".to_string(), lines.clone());
        restored_seen = Some(scripts.seen("Coordinator"));
        orchestrator(scripts, store.clone())
            .run_turn(
                TurnRequest::new(text).in_conversation("conv_eq"),
                CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    let continued_last = continued_seen.lock().unwrap().last().cloned().unwrap();
    let restored_last = restored_seen
        .unwrap()
        .lock()
        .unwrap()
        .last()
        .cloned()
        .unwrap();
    assert_eq!(continued_last, restored_last);
}

#[tokio::test]
async fn test_concurrent_turns_on_one_conversation_are_serialized() {
    let store = Arc::new(MemorySessionStore::new());
    let mut scripts = Scripts::default()
        .with("Coordinator", &["a", "b", "c"])
        .slow(Duration::from_millis(30));
    let seen = scripts.seen("Coordinator");
    let orch = Arc::new(orchestrator(scripts, store.clone()));

    let turns: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|text| {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move {
                orch.run_turn(
                    TurnRequest::new(text).in_conversation("conv_sf"),
                    CancellationToken::new(),
                )
                .await
            })
        })
        .collect();
    for turn in turns {
        turn.await.unwrap().unwrap();
    }

    orch.run_turn(
        TurnRequest::new("third").in_conversation("conv_sf"),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let seen = seen.lock().unwrap();
    let users: Vec<&str> = seen
        .last()
        .unwrap()
        .iter()
        .filter(|(source, _)| source == "user")
        .map(|(_, text)| text.as_str())
        .collect();
    assert_eq!(users.len(), 3);
    assert_eq!(users[2], "third");
}
