//! Webhook 接入：去重租约 + 后台处理流水线

pub mod dedup;
pub mod pipeline;

pub use dedup::{DedupGuard, DedupLease, InMemoryLeaseStore, LeaseStore};
pub use pipeline::{DrainWebhooks, WebhookNotification, WebhookPipeline};
