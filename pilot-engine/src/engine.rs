//! The orchestration engine facade.
//!
//! Owns the provider registry, breaker state, job store, notification
//! bus, and the registered waterfalls. Callers trigger jobs, run queued
//! jobs, and observe results either by polling the store or subscribing
//! to the bus.

use crate::breaker::RouterState;
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::errors::{CallFailure, EngineError, FailureKind};
use crate::jobs::{
    CreateOutcome, InMemoryJobStore, JobStatus, JobStore, NotificationRecord, PerformanceSnapshot,
    PipelineJob, StageRecord,
};
use crate::notify::{NotificationBus, NotificationEvent};
use crate::pipeline::{WaterfallRunner, WaterfallSpec};
use crate::provider::ProviderRegistry;
use crate::router::Router;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// How a trigger resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// A new job was queued.
    Accepted,
    /// An active job for the same `(key, kind)` already exists; no new
    /// job was created.
    Duplicate,
}

/// The response to a trigger.
#[derive(Debug, Clone, Copy)]
pub struct Trigger {
    /// Whether a job was created or coalesced.
    pub status: TriggerStatus,
    /// The job this trigger resolved to, new or existing.
    pub job_id: Uuid,
}

/// A job together with its stage trail.
#[derive(Debug, Clone)]
pub struct JobStatusView {
    /// The job row.
    pub job: PipelineJob,
    /// The append-only trail, in seq order.
    pub stages: Vec<StageRecord>,
}

/// The orchestration engine.
pub struct Engine {
    config: EngineConfig,
    router: Arc<Router>,
    store: Arc<dyn JobStore>,
    bus: NotificationBus,
    runner: WaterfallRunner,
    pipelines: HashMap<String, WaterfallSpec>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// The registered pipeline kinds.
    #[must_use]
    pub fn kinds(&self) -> Vec<&str> {
        self.pipelines.keys().map(String::as_str).collect()
    }

    /// The router, exposing breaker state for inspection.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Subscribes to terminal-transition events pushed after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.bus.subscribe()
    }

    /// Requests a pipeline run for `(key, kind)`.
    ///
    /// Duplicate triggers while a job for the same `(key, kind)` is
    /// queued, running, or awaiting a scheduled retry coalesce onto the
    /// existing job.
    pub async fn trigger(
        &self,
        key: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<Trigger, EngineError> {
        if !self.pipelines.contains_key(kind) {
            return Err(EngineError::UnknownKind(kind.to_string()));
        }

        let outcome = self.store.create_job(key, kind, payload).await?;
        let trigger = match outcome {
            CreateOutcome::Created(job_id) => {
                tracing::info!(key, kind, job_id = %job_id, "job queued");
                Trigger {
                    status: TriggerStatus::Accepted,
                    job_id,
                }
            }
            CreateOutcome::Duplicate(job_id) => {
                tracing::debug!(key, kind, job_id = %job_id, "trigger coalesced");
                Trigger {
                    status: TriggerStatus::Duplicate,
                    job_id,
                }
            }
        };
        Ok(trigger)
    }

    /// Runs one queued job to a terminal or retry-scheduled state,
    /// returning the status it ended in.
    ///
    /// The whole run is bounded by the configured job budget; exceeding
    /// it cancels in-flight provider calls and fails the job with a
    /// budget-exhausted failure.
    pub async fn run_job(&self, id: Uuid) -> Result<JobStatus, EngineError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(EngineError::UnknownJob(id))?;
        if job.status != JobStatus::Queued {
            return Err(EngineError::Internal(format!(
                "job {id} is {}, not queued",
                job.status
            )));
        }
        let spec = self
            .pipelines
            .get(&job.kind)
            .ok_or_else(|| EngineError::UnknownKind(job.kind.clone()))?;

        self.store.mark_running(id).await?;
        tracing::info!(job_id = %id, key = %job.key, kind = %job.kind, attempt = job.attempt, "job running");

        let cancel = CancellationToken::new();
        let watchdog = {
            let token = cancel.clone();
            let budget = self.config.job_budget();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                token.cancel("job budget exhausted");
            })
        };

        let run = self
            .runner
            .run(spec, id, &job.key, &job.payload, &cancel)
            .await;
        watchdog.abort();
        let outcome = run?;

        if outcome.ok {
            self.store.mark_ok(id, outcome.result).await?;
            self.notify_terminal(&job, JobStatus::Ok).await?;
            tracing::info!(job_id = %id, "job ok");
            return Ok(JobStatus::Ok);
        }

        let failure = outcome
            .failure
            .unwrap_or_else(|| CallFailure::transient("pipeline produced no sink output"));

        if failure.kind != FailureKind::Permanent
            && self.config.retry.allows_retry(job.attempt)
        {
            let due = self.config.retry.next_retry_at(Utc::now(), job.attempt);
            self.store.schedule_retry(id, failure.clone(), due).await?;
            tracing::warn!(
                job_id = %id,
                attempt = job.attempt,
                due = %due,
                error = %failure,
                "job failed, retry scheduled"
            );
        } else {
            self.store.mark_failed(id, failure.clone()).await?;
            self.notify_terminal(&job, JobStatus::Failed).await?;
            tracing::warn!(job_id = %id, error = %failure, "job failed terminally");
        }
        Ok(JobStatus::Failed)
    }

    /// Re-queues failed jobs whose retry is due and returns their ids.
    pub async fn requeue_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let requeued = self.store.requeue_due(now).await?;
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "jobs re-queued for retry");
        }
        Ok(requeued)
    }

    /// Fetches a job and its stage trail.
    pub async fn job_status(&self, id: Uuid) -> Result<JobStatusView, EngineError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or(EngineError::UnknownJob(id))?;
        let stages = self.store.stage_records(id).await?;
        Ok(JobStatusView { job, stages })
    }

    /// Aggregated per-provider metrics over the whole stage trail.
    pub async fn performance_snapshot(&self) -> Result<PerformanceSnapshot, EngineError> {
        self.store.performance_snapshot().await
    }

    /// Persisted notifications for the configured channel, oldest first.
    /// This is the at-least-once source of truth the push channel echoes.
    pub async fn missed_notifications(&self) -> Result<Vec<NotificationRecord>, EngineError> {
        self.store.notifications(&self.config.channel).await
    }

    /// Persists the notification first, then pushes it. A crash between
    /// the two loses only the push; the record survives for replay.
    async fn notify_terminal(
        &self,
        job: &PipelineJob,
        status: JobStatus,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        self.store
            .record_notification(NotificationRecord {
                id: Uuid::new_v4(),
                channel: self.config.channel.clone(),
                key: job.key.clone(),
                kind: job.kind.clone(),
                status,
                created_at: now,
            })
            .await?;

        self.bus.publish(NotificationEvent {
            job_id: job.id,
            channel: self.config.channel.clone(),
            key: job.key.clone(),
            kind: job.kind.clone(),
            status,
            timestamp: now,
        });
        Ok(())
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<ProviderRegistry>>,
    store: Option<Arc<dyn JobStore>>,
    pipelines: Vec<WaterfallSpec>,
}

impl EngineBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the provider registry. Required.
    #[must_use]
    pub fn with_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the job store. Defaults to an in-memory store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Registers a pipeline under its kind. Later registrations of the
    /// same kind replace earlier ones.
    #[must_use]
    pub fn register_pipeline(mut self, spec: WaterfallSpec) -> Self {
        self.pipelines.push(spec);
        self
    }

    /// Finalizes the engine.
    pub fn build(self) -> Result<Engine, EngineError> {
        let registry = self
            .registry
            .ok_or_else(|| EngineError::Internal("a provider registry is required".into()))?;
        let store: Arc<dyn JobStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new()));

        let router = Arc::new(Router::new(
            registry,
            RouterState::new(self.config.breaker),
        ));
        let runner = WaterfallRunner::new(router.clone(), store.clone(), self.config.router);

        let mut pipelines = HashMap::new();
        for spec in self.pipelines {
            pipelines.insert(spec.kind().to_string(), spec);
        }

        Ok(Engine {
            config: self.config,
            router,
            store,
            bus: NotificationBus::default(),
            runner,
            pipelines,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JsonPromptBuilder, StageSpec};
    use crate::provider::{ProviderId, Role};
    use crate::retry::RetryPolicy;
    use crate::testing::{FixedDelayAdapter, ScriptedAdapter, ScriptedReply};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn prompt() -> Arc<dyn crate::pipeline::PromptBuilder> {
        Arc::new(JsonPromptBuilder::new("system"))
    }

    fn triad() -> WaterfallSpec {
        WaterfallSpec::builder("triad")
            .stage(StageSpec::new(
                "strategist",
                Role::Strategist,
                vec![ProviderId::Local],
                prompt(),
            ))
            .stage(StageSpec::new(
                "briefer",
                Role::Briefer,
                vec![ProviderId::Local],
                prompt(),
            ))
            .stage(
                StageSpec::new(
                    "consolidator",
                    Role::Consolidator,
                    vec![ProviderId::Local],
                    prompt(),
                )
                .with_dependencies(vec!["strategist", "briefer"])
                .with_hard_dependencies(vec!["strategist"]),
            )
            .build()
            .expect("valid triad")
    }

    fn single_stage(chain: Vec<ProviderId>) -> WaterfallSpec {
        WaterfallSpec::builder("plan")
            .stage(StageSpec::new("planner", Role::Planner, chain, prompt()))
            .build()
            .expect("valid spec")
    }

    fn engine_with(
        adapters: Vec<Arc<dyn crate::provider::ProviderAdapter>>,
        config: EngineConfig,
        pipeline: WaterfallSpec,
    ) -> Engine {
        let mut builder = ProviderRegistry::builder();
        for adapter in adapters {
            builder = builder.register(adapter);
        }
        Engine::builder()
            .with_config(config)
            .with_registry(Arc::new(builder.build()))
            .register_pipeline(pipeline)
            .build()
            .expect("engine builds")
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_run_and_notify_happy_path() {
        let engine = engine_with(
            vec![Arc::new(FixedDelayAdapter::new(
                ProviderId::Local,
                Duration::from_millis(20),
            ))],
            EngineConfig::default(),
            triad(),
        );
        let mut events = engine.subscribe();

        let trigger = engine
            .trigger("AAPL", "triad", serde_json::json!({"depth": 1}))
            .await
            .unwrap();
        assert_eq!(trigger.status, TriggerStatus::Accepted);

        let status = engine.run_job(trigger.job_id).await.unwrap();
        assert_eq!(status, JobStatus::Ok);

        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Ok);
        assert!(view.job.result.is_some());
        assert_eq!(view.stages.len(), 3);

        let event = events.recv().await.unwrap();
        assert_eq!(event.key, "AAPL");
        assert_eq!(event.status, JobStatus::Ok);

        // The push is backed by a persisted record.
        let persisted = engine.missed_notifications().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].status, JobStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_trigger_coalesces_until_terminal() {
        let engine = engine_with(
            vec![Arc::new(FixedDelayAdapter::new(
                ProviderId::Local,
                Duration::from_millis(10),
            ))],
            EngineConfig::default(),
            triad(),
        );

        let first = engine.trigger("AAPL", "triad", serde_json::json!({})).await.unwrap();
        let second = engine.trigger("AAPL", "triad", serde_json::json!({})).await.unwrap();
        assert_eq!(second.status, TriggerStatus::Duplicate);
        assert_eq!(second.job_id, first.job_id);

        engine.run_job(first.job_id).await.unwrap();

        let third = engine.trigger("AAPL", "triad", serde_json::json!({})).await.unwrap();
        assert_eq!(third.status, TriggerStatus::Accepted);
        assert_ne!(third.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_rejected() {
        let engine = engine_with(
            vec![Arc::new(FixedDelayAdapter::new(
                ProviderId::Local,
                Duration::from_millis(1),
            ))],
            EngineConfig::default(),
            triad(),
        );
        let err = engine
            .trigger("AAPL", "nonsense", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownKind(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_schedules_retry_then_recovers() {
        let adapter = Arc::new(ScriptedAdapter::new(
            ProviderId::Local,
            vec![ScriptedReply::transient_failure("503")],
        ));
        let engine = engine_with(
            vec![adapter.clone()],
            EngineConfig::default().with_retry(
                RetryPolicy::default()
                    .with_max_attempts(3)
                    .with_base_delay_ms(1000),
            ),
            single_stage(vec![ProviderId::Local]),
        );

        let trigger = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
        let status = engine.run_job(trigger.job_id).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert!(view.job.next_retry_at.is_some());
        assert_eq!(view.job.attempt, 1);
        // Not terminal, so no notification yet.
        assert!(engine.missed_notifications().await.unwrap().is_empty());

        // While the retry is pending the slot stays occupied.
        let dup = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
        assert_eq!(dup.status, TriggerStatus::Duplicate);

        let later = Utc::now() + chrono::Duration::hours(1);
        let requeued = engine.requeue_due_jobs(later).await.unwrap();
        assert_eq!(requeued, vec![trigger.job_id]);

        // Script exhausted: the adapter now succeeds.
        let status = engine.run_job(trigger.job_id).await.unwrap();
        assert_eq!(status, JobStatus::Ok);
        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_terminal_without_retry() {
        let engine = engine_with(
            vec![Arc::new(ScriptedAdapter::new(
                ProviderId::Local,
                vec![ScriptedReply::permanent_failure("unparseable")],
            ))],
            EngineConfig::default(),
            single_stage(vec![ProviderId::Local]),
        );
        let mut events = engine.subscribe();

        let trigger = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
        engine.run_job(trigger.job_id).await.unwrap();

        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert!(view.job.next_retry_at.is_none());
        assert_eq!(view.job.error.unwrap().kind, FailureKind::Permanent);

        assert_eq!(events.recv().await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_end_terminal() {
        let engine = engine_with(
            vec![Arc::new(ScriptedAdapter::new(
                ProviderId::Local,
                vec![
                    ScriptedReply::transient_failure("one"),
                    ScriptedReply::transient_failure("two"),
                ],
            ))],
            EngineConfig::default().with_retry(RetryPolicy::default().with_max_attempts(2)),
            single_stage(vec![ProviderId::Local]),
        );

        let trigger = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
        engine.run_job(trigger.job_id).await.unwrap();
        engine
            .requeue_due_jobs(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        engine.run_job(trigger.job_id).await.unwrap();

        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.status, JobStatus::Failed);
        assert_eq!(view.job.attempt, 2);
        // Final attempt: terminal, notified, no retry scheduled.
        assert!(view.job.next_retry_at.is_none());
        assert_eq!(engine.missed_notifications().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_budget_bounds_the_run() {
        let engine = engine_with(
            vec![Arc::new(FixedDelayAdapter::new(
                ProviderId::Local,
                Duration::from_secs(120),
            ))],
            EngineConfig::default()
                .with_job_budget_ms(1000)
                .with_retry(RetryPolicy::default().with_max_attempts(1)),
            single_stage(vec![ProviderId::Local]),
        );

        let trigger = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
        let status = engine.run_job(trigger.job_id).await.unwrap();
        assert_eq!(status, JobStatus::Failed);

        let view = engine.job_status(trigger.job_id).await.unwrap();
        assert_eq!(view.job.error.unwrap().kind, FailureKind::BudgetExhausted);
    }

    #[tokio::test]
    async fn test_run_job_rejects_non_queued() {
        let engine = engine_with(
            vec![Arc::new(FixedDelayAdapter::new(
                ProviderId::Local,
                Duration::from_millis(1),
            ))],
            EngineConfig::default(),
            triad(),
        );
        let err = engine.run_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownJob(_)));
    }
}
