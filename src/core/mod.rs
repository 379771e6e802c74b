//! 核心编排层：消息模型、Worker 契约、发言选择、终止判定、会话快照、轮次编排、优雅关闭

pub mod error;
pub mod message;
pub mod orchestrator;
pub mod selector;
pub mod session;
pub mod shutdown;
pub mod termination;
pub mod worker;

pub use error::HiveError;
pub use message::{Message, MessageContent, MessageKind, SYSTEM_SOURCE, USER_SOURCE};
pub use orchestrator::{
    new_conversation_id, OrchestratorSettings, TurnFailure, TurnOrchestrator, TurnOutcome,
    TurnRequest,
};
pub use selector::{select, Route};
pub use session::{Session, Snapshot, SnapshotError, SNAPSHOT_VERSION};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use termination::{StopReason, TerminationDetector};
pub use worker::{
    default_roster_specs, Roster, TurnContext, Worker, WorkerFactory, WorkerRole, WorkerSpec,
};
