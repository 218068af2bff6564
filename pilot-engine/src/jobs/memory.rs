//! In-memory job store for tests and single-process embedding.

use super::{
    blob_hash, CreateOutcome, JobStatus, JobStore, NotificationRecord, PerformanceSnapshot,
    PipelineJob, ProviderMetrics, StageRecord,
};
use crate::errors::{CallFailure, EngineError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, PipelineJob>,
    records: HashMap<Uuid, Vec<StageRecord>>,
    notifications: Vec<NotificationRecord>,
    blobs: HashMap<String, Vec<u8>>,
}

/// [`JobStore`] backed by process memory.
///
/// Same semantics as the SQLite store, including the active-uniqueness
/// rule, minus durability.
#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(
        &self,
        key: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<CreateOutcome, EngineError> {
        let mut inner = self.inner.lock();

        let existing = inner
            .jobs
            .values()
            .find(|job| job.key == key && job.kind == kind && job.holds_slot())
            .map(|job| job.id);
        if let Some(id) = existing {
            return Ok(CreateOutcome::Duplicate(id));
        }

        let now = Utc::now();
        let job = PipelineJob {
            id: Uuid::new_v4(),
            key: key.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Queued,
            attempt: 1,
            payload,
            result: None,
            error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        };
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(CreateOutcome::Created(id))
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_ok(&self, id: Uuid, result: serde_json::Value) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        job.status = JobStatus::Ok;
        job.result = Some(result);
        job.error = None;
        job.next_retry_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: CallFailure) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.next_retry_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        error: CallFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.next_retry_at = Some(next_retry_at);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let mut inner = self.inner.lock();
        let mut requeued = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Failed
                && job.next_retry_at.is_some_and(|due| due <= now)
            {
                job.status = JobStatus::Queued;
                job.attempt += 1;
                job.next_retry_at = None;
                job.updated_at = now;
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<PipelineJob>, EngineError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn find_active(&self, key: &str, kind: &str) -> Result<Option<Uuid>, EngineError> {
        Ok(self
            .inner
            .lock()
            .jobs
            .values()
            .find(|job| job.key == key && job.kind == kind && job.holds_slot())
            .map(|job| job.id))
    }

    async fn append_stage_record(&self, record: StageRecord) -> Result<(), EngineError> {
        self.inner
            .lock()
            .records
            .entry(record.job_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn stage_records(&self, job_id: Uuid) -> Result<Vec<StageRecord>, EngineError> {
        let mut records = self
            .inner
            .lock()
            .records
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    async fn record_notification(&self, record: NotificationRecord) -> Result<(), EngineError> {
        self.inner.lock().notifications.push(record);
        Ok(())
    }

    async fn notifications(&self, channel: &str) -> Result<Vec<NotificationRecord>, EngineError> {
        Ok(self
            .inner
            .lock()
            .notifications
            .iter()
            .filter(|n| n.channel == channel)
            .cloned()
            .collect())
    }

    async fn store_blob(&self, content: &[u8]) -> Result<String, EngineError> {
        let hash = blob_hash(content);
        self.inner
            .lock()
            .blobs
            .entry(hash.clone())
            .or_insert_with(|| content.to_vec());
        Ok(hash)
    }

    async fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(self.inner.lock().blobs.get(hash).cloned())
    }

    async fn performance_snapshot(&self) -> Result<PerformanceSnapshot, EngineError> {
        let inner = self.inner.lock();
        let mut totals: std::collections::BTreeMap<_, (u64, u64, u64, u64, u64)> =
            std::collections::BTreeMap::new();

        for record in inner.records.values().flatten() {
            let Some(provider) = record.provider else {
                continue;
            };
            let entry = totals.entry(provider).or_default();
            entry.0 += 1;
            if !record.ok {
                entry.1 += 1;
            }
            entry.2 += record.latency_ms;
            entry.3 += u64::from(record.tokens.input);
            entry.4 += u64::from(record.tokens.output);
        }

        #[allow(clippy::cast_precision_loss)]
        let providers = totals
            .into_iter()
            .map(|(provider, (calls, failures, latency, tokens_in, tokens_out))| {
                let avg_latency_ms = latency as f64 / calls as f64;
                (
                    provider,
                    ProviderMetrics {
                        calls,
                        failures,
                        avg_latency_ms,
                        tokens_in,
                        tokens_out,
                    },
                )
            })
            .collect();

        Ok(PerformanceSnapshot { providers })
    }
}
