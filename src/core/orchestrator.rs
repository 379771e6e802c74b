//! 轮次编排器
//!
//! 每次调用的状态机：
//! `RESOLVE_ID → RESTORE_OR_CREATE → APPEND_INPUT → {SELECT → ACT → APPEND}* → PERSIST → RETURN`
//!
//! - 快照读取失败或损坏：告警后从空会话开始，不让请求失败
//! - Worker 出错 / 超时 / 取消：中止本轮且**不写快照**，持久状态停留在上一次成功的轮次
//! - 保存失败：仍返回本轮回复，错误记录在 `TurnOutcome::persist_error`
//! - 对外回复只取 controller 的消息，专家的原始工具结果不会透出
//! - 同一会话的多轮默认串行（single-flight）；关闭后为 last-writer-wins

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorSection;
use crate::store::SessionStore;

use super::error::HiveError;
use super::message::Message;
use super::selector::{parse_delegation, select, user_visible_part, Route};
use super::session::{Session, Snapshot};
use super::termination::{StopReason, TerminationDetector};
use super::worker::{Roster, TurnContext, Worker, WorkerFactory};

const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, something went wrong on our side. Please try again in a moment.";

/// 一次调用的输入
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// 为空时生成新的会话 ID
    pub conversation_id: Option<String>,
    pub message: String,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            message: message.into(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// 成功完成的一轮
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: String,
    /// controller 最后一条面向用户的消息（已去除完成 / 失败标记）
    pub reply: String,
    pub stop_reason: StopReason,
    /// 本轮追加的全部消息（含用户输入）
    pub turn_messages: Vec<Message>,
    /// 快照保存失败的原因；回复不受影响，只影响后续续接
    pub persist_error: Option<String>,
}

/// 失败的一轮：带上会话 ID，调用方可以在上一次成功的快照上重试
#[derive(Debug, Error)]
#[error("turn failed for conversation {conversation_id}: {error}")]
pub struct TurnFailure {
    pub conversation_id: String,
    #[source]
    pub error: HiveError,
}

/// 编排器运行参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_timeout: Duration,
    pub turn_timeout: Duration,
    /// 0 表示不裁剪
    pub max_history_messages: usize,
    pub single_flight: bool,
    /// 本轮没有可展示的 controller 消息时使用
    pub fallback_reply: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_section(&OrchestratorSection::default())
    }
}

impl OrchestratorSettings {
    pub fn from_section(section: &OrchestratorSection) -> Self {
        Self {
            worker_timeout: Duration::from_secs(section.worker_timeout_secs.max(1)),
            turn_timeout: Duration::from_secs(section.turn_timeout_secs.max(1)),
            max_history_messages: section.max_history_messages,
            single_flight: section.single_flight,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }

    pub fn with_fallback_reply(mut self, reply: impl Into<String>) -> Self {
        self.fallback_reply = reply.into();
        self
    }
}

type ConversationLock = tokio::sync::Mutex<()>;

/// 轮次编排器：跨请求无状态，只持有名册、工厂与存储
pub struct TurnOrchestrator {
    store: Arc<dyn SessionStore>,
    roster: Roster,
    factory: Arc<dyn WorkerFactory>,
    detector: TerminationDetector,
    settings: OrchestratorSettings,
    locks: Mutex<HashMap<String, Weak<ConversationLock>>>,
}

/// 新会话 ID
pub fn new_conversation_id() -> String {
    format!("conv_{}", uuid::Uuid::new_v4())
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        roster: Roster,
        factory: Arc<dyn WorkerFactory>,
        detector: TerminationDetector,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            roster,
            factory,
            detector,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn fallback_reply(&self) -> &str {
        &self.settings.fallback_reply
    }

    /// 跑完一轮
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnFailure> {
        let conversation_id = request
            .conversation_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_conversation_id);
        let fail = |error: HiveError| TurnFailure {
            conversation_id: conversation_id.clone(),
            error,
        };

        let text = request.message.trim();
        if text.is_empty() {
            return Err(fail(HiveError::Validation(
                "message must not be empty".to_string(),
            )));
        }

        let _guard = if self.settings.single_flight {
            let lock = self.conversation_lock(&conversation_id);
            tokio::select! {
                _ = cancel.cancelled() => return Err(fail(HiveError::Cancelled)),
                guard = lock.lock_owned() => Some(guard),
            }
        } else {
            None
        };

        let deadline = Instant::now() + self.settings.turn_timeout;
        let mut session = self.restore_or_create(&conversation_id).await;
        let mut workers = self.instantiate(&session).map_err(&fail)?;

        let turn_count = session.begin_turn(self.settings.max_history_messages);
        session.append(Message::user(text));
        tracing::info!(
            conversation_id = %conversation_id,
            turn = turn_count,
            history = session.messages().len(),
            "Turn started"
        );

        let ctx = TurnContext {
            conversation_id: conversation_id.clone(),
            turn_count,
            cancel,
        };

        let stop_reason = match self.drive(&mut session, &mut workers, &ctx, deadline).await {
            Ok(reason) => reason,
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    turn = turn_count,
                    kind = error.kind(),
                    "Turn aborted, snapshot not saved: {}",
                    error
                );
                return Err(fail(error));
            }
        };

        let memory: BTreeMap<String, serde_json::Value> = workers
            .iter()
            .filter_map(|(name, worker)| worker.export_memory().map(|m| (name.clone(), m)))
            .collect();
        let persist_error = self.persist(&session, memory).await;

        let reply = self
            .reply_from(session.turn_messages())
            .unwrap_or_else(|| self.settings.fallback_reply.clone());

        tracing::info!(
            conversation_id = %conversation_id,
            turn = turn_count,
            stop_reason = %stop_reason,
            messages = session.turn_messages().len(),
            persisted = persist_error.is_none(),
            "Turn finished"
        );

        Ok(TurnOutcome {
            conversation_id,
            reply,
            stop_reason,
            turn_messages: session.turn_messages().to_vec(),
            persist_error,
        })
    }

    /// 选择 → 执行 → 追加，直到满足终止条件
    async fn drive(
        &self,
        session: &mut Session,
        workers: &mut HashMap<String, Box<dyn Worker>>,
        ctx: &TurnContext,
        deadline: Instant,
    ) -> Result<StopReason, HiveError> {
        let controller = self.roster.controller_name().to_string();
        loop {
            let route = select(session.messages(), &self.roster);
            if let Some(reason) = self.detector.evaluate(
                session.messages(),
                session.turn_messages().len(),
                &route,
                &controller,
            ) {
                return Ok(reason);
            }
            let Route::ToWorker(name) = route else {
                return Ok(StopReason::Deferred);
            };

            // 委派目标无效时 controller 需要再说一次；先插入系统纠正，保证相邻消息来源不同
            if session.last_speaker() == Some(name.as_str()) {
                session.append(Message::system_event(self.correction_for(session)));
                if session.turn_messages().len() >= self.detector.max_messages() {
                    return Ok(StopReason::MaxMessages(self.detector.max_messages()));
                }
            }

            let message = self
                .invoke(workers, &name, session.messages(), ctx, deadline)
                .await?;
            session.append(message);
        }
    }

    async fn invoke(
        &self,
        workers: &mut HashMap<String, Box<dyn Worker>>,
        name: &str,
        log: &[Message],
        ctx: &TurnContext,
        deadline: Instant,
    ) -> Result<Message, HiveError> {
        let worker = workers
            .get_mut(name)
            .ok_or_else(|| HiveError::worker(name, "not part of this turn"))?;

        let started = std::time::Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(HiveError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(HiveError::TurnTimeout),
            acted = tokio::time::timeout(self.settings.worker_timeout, worker.act(log, ctx)) => {
                acted.unwrap_or_else(|_| Err(HiveError::WorkerTimeout(name.to_string())))
            }
        };
        let mut message = result?;

        if message.source != name {
            tracing::warn!(
                worker = %name,
                claimed = %message.source,
                "Worker produced a message under another name, re-attributing"
            );
            message.source = name.to_string();
        }
        tracing::debug!(
            conversation_id = %ctx.conversation_id,
            worker = %name,
            kind = ?message.kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker acted"
        );
        Ok(message)
    }

    fn correction_for(&self, session: &Session) -> String {
        let target = session
            .messages()
            .last()
            .and_then(|m| m.content.text())
            .and_then(parse_delegation)
            .unwrap_or("(none)")
            .to_string();
        let valid: Vec<&str> = self
            .roster
            .specialists()
            .map(|s| s.name.as_str())
            .collect();
        tracing::warn!(delegate = %target, "Controller delegated to an unknown worker");
        format!(
            "'{target}' is not an available specialist. Delegate to one of: {}, or answer the user directly.",
            valid.join(", ")
        )
    }

    /// 本轮最后一条面向用户的 controller 文本
    fn reply_from(&self, turn: &[Message]) -> Option<String> {
        let controller = self.roster.controller_name();
        turn.iter()
            .rev()
            .filter(|m| m.is_from(controller))
            .filter_map(|m| m.content.text())
            .map(|text| self.detector.strip_markers(user_visible_part(text)))
            .find(|text| !text.is_empty())
    }

    async fn restore_or_create(&self, conversation_id: &str) -> Session {
        let blob = match self.store.load(conversation_id).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Session::new(conversation_id),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Snapshot load failed, starting a fresh session: {}",
                    e
                );
                return Session::new(conversation_id);
            }
        };
        match Snapshot::decode(&blob).and_then(|s| Session::restore(conversation_id, s, &self.roster)) {
            Ok(session) => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    turns = session.turn_count(),
                    messages = session.messages().len(),
                    "Session restored"
                );
                session
            }
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    "Discarding unusable snapshot, starting a fresh session: {}",
                    e
                );
                if let Err(e) = self.store.delete(conversation_id).await {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        "Unusable snapshot could not be deleted: {}",
                        e
                    );
                }
                Session::new(conversation_id)
            }
        }
    }

    /// 每轮从静态配置重新构建 Worker，并导入快照中的私有记忆
    fn instantiate(&self, session: &Session) -> Result<HashMap<String, Box<dyn Worker>>, HiveError> {
        let mut workers = HashMap::new();
        for spec in self.roster.actors() {
            let mut worker = self.factory.build(spec, &self.roster)?;
            if let Some(memory) = session.worker_memory(&spec.name) {
                if let Err(e) = worker.import_memory(memory.clone()) {
                    tracing::warn!(
                        conversation_id = %session.conversation_id(),
                        worker = %spec.name,
                        "Ignoring unreadable worker memory: {}",
                        e
                    );
                }
            }
            workers.insert(spec.name.clone(), worker);
        }
        Ok(workers)
    }

    async fn persist(
        &self,
        session: &Session,
        memory: BTreeMap<String, serde_json::Value>,
    ) -> Option<String> {
        let snapshot = session.snapshot(memory);
        let result = match snapshot.encode() {
            Ok(blob) => self
                .store
                .save(session.conversation_id(), &blob)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %session.conversation_id(),
                    "Snapshot save failed, reply still delivered: {}",
                    e
                );
                Some(e)
            }
        }
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<ConversationLock> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(ConversationLock::new(()));
        locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}
