//! Durable pipeline jobs and their execution trail.
//!
//! A job is one requested pipeline run, keyed by `(key, kind)` so the
//! same subject can run different pipelines concurrently while duplicate
//! triggers of the same pipeline coalesce. Stage records are the
//! append-only trail of what each stage actually did.

mod memory;
mod sqlite;

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

use crate::errors::{CallFailure, EngineError};
use crate::provider::{ProviderId, Role, TokenUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting to run.
    Queued,
    /// A worker is executing the pipeline.
    Running,
    /// Terminal success.
    Ok,
    /// Failed; may still be re-queued if `next_retry_at` is set.
    Failed,
}

impl JobStatus {
    /// Stable string form used in persisted rows and notifications.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether the status counts as active for the uniqueness rule.
    ///
    /// A `failed` job with a retry scheduled also holds its `(key, kind)`
    /// slot; see [`PipelineJob::holds_slot`].
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    /// Unique job id.
    pub id: Uuid,
    /// Subject key, e.g. a ticker or document id.
    pub key: String,
    /// Pipeline kind to run for the subject.
    pub kind: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// 1-based attempt counter; incremented on each re-queue.
    pub attempt: u32,
    /// Trigger payload forwarded to the pipeline.
    pub payload: serde_json::Value,
    /// Final pipeline output when the job ended ok.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure detail when the job ended failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallFailure>,
    /// Earliest time a failed job becomes due for re-queueing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl PipelineJob {
    /// Whether this job occupies the `(key, kind)` slot for the
    /// uniqueness rule: queued, running, or failed with a retry still
    /// scheduled. A trigger arriving during the retry window must
    /// coalesce onto this job, not create a second one.
    #[must_use]
    pub const fn holds_slot(&self) -> bool {
        self.status.is_active() || self.next_retry_at.is_some()
    }
}

/// Append-only record of one stage execution within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Owning job.
    pub job_id: Uuid,
    /// Position in the job's trail; dense from 0 per job.
    pub seq: u32,
    /// Stage name from the pipeline definition.
    pub stage: String,
    /// Role the stage ran as.
    pub role: Role,
    /// Provider whose envelope was used, when one was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    /// Whether the stage produced a usable output.
    pub ok: bool,
    /// Whether routing hedged during this stage.
    pub hedged: bool,
    /// Providers dispatched while routing this stage.
    pub attempts: u32,
    /// Observed stage latency.
    pub latency_ms: u64,
    /// Token accounting for the winning call.
    #[serde(default)]
    pub tokens: TokenUsage,
    /// Stable failure code when the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable failure detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Stage output when it succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// When the record was appended.
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of asking the store to create a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new job row was created.
    Created(Uuid),
    /// An active job for the same `(key, kind)` already exists.
    Duplicate(Uuid),
}

impl CreateOutcome {
    /// The id of the job this trigger resolved to, new or existing.
    #[must_use]
    pub const fn job_id(self) -> Uuid {
        match self {
            Self::Created(id) | Self::Duplicate(id) => id,
        }
    }
}

/// A persisted terminal-transition notification.
///
/// The store is the source of truth for delivery: a notification row is
/// written in the same transition as the job status, and the in-process
/// broadcast channel is a low-latency duplicate of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Unique notification id.
    pub id: Uuid,
    /// Channel name, e.g. `pipeline.status`.
    pub channel: String,
    /// Subject key of the finished job.
    pub key: String,
    /// Pipeline kind of the finished job.
    pub kind: String,
    /// Terminal status reached.
    pub status: JobStatus,
    /// When the transition happened.
    pub created_at: DateTime<Utc>,
}

/// Aggregated call metrics for one provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderMetrics {
    /// Stages routed to this provider.
    pub calls: u64,
    /// Of those, how many failed.
    pub failures: u64,
    /// Mean stage latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Total prompt tokens.
    pub tokens_in: u64,
    /// Total completion tokens.
    pub tokens_out: u64,
}

/// Per-provider metrics over the whole stage-record trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Metrics keyed by provider; `BTreeMap` for stable iteration order.
    pub providers: BTreeMap<ProviderId, ProviderMetrics>,
}

/// Durable storage for jobs, stage records, notifications, and the
/// content-addressed blob log.
///
/// Implementations enforce the active-uniqueness rule: at most one
/// slot-holding job per `(key, kind)` at any time, where slot-holding
/// means queued, running, or failed with a retry scheduled.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a job in `queued` at attempt 1, or reports the existing
    /// slot-holding job for the same `(key, kind)`.
    async fn create_job(
        &self,
        key: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<CreateOutcome, EngineError>;

    /// Transitions a queued job to `running`.
    async fn mark_running(&self, id: Uuid) -> Result<(), EngineError>;

    /// Terminal success with the pipeline output.
    async fn mark_ok(&self, id: Uuid, result: serde_json::Value) -> Result<(), EngineError>;

    /// Terminal failure with no further retry scheduled.
    async fn mark_failed(&self, id: Uuid, error: CallFailure) -> Result<(), EngineError>;

    /// Failure with a retry scheduled: status `failed`, `next_retry_at`
    /// set, attempt counter untouched until the re-queue happens.
    async fn schedule_retry(
        &self,
        id: Uuid,
        error: CallFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), EngineError>;

    /// Re-queues every failed job whose `next_retry_at` is due,
    /// incrementing its attempt counter. Returns the re-queued ids.
    async fn requeue_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError>;

    /// Fetches a job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>, EngineError>;

    /// Finds the slot-holding job for a `(key, kind)`, if any.
    async fn find_active(&self, key: &str, kind: &str) -> Result<Option<Uuid>, EngineError>;

    /// Appends one stage record to a job's trail.
    async fn append_stage_record(&self, record: StageRecord) -> Result<(), EngineError>;

    /// Returns a job's trail in seq order.
    async fn stage_records(&self, job_id: Uuid) -> Result<Vec<StageRecord>, EngineError>;

    /// Persists a terminal-transition notification.
    async fn record_notification(&self, record: NotificationRecord) -> Result<(), EngineError>;

    /// Returns persisted notifications for a channel, oldest first.
    async fn notifications(&self, channel: &str) -> Result<Vec<NotificationRecord>, EngineError>;

    /// Stores content under its SHA-256 hex digest and returns the digest.
    /// Identical content stores once.
    async fn store_blob(&self, content: &[u8]) -> Result<String, EngineError>;

    /// Fetches content by digest.
    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, EngineError>;

    /// Aggregates per-provider metrics over all stage records.
    async fn performance_snapshot(&self) -> Result<PerformanceSnapshot, EngineError>;
}

/// Computes the content address for a blob.
#[must_use]
pub fn blob_hash(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content))
}
