//! DAG execution for validated waterfalls.

use super::{StageInputs, WaterfallSpec};
use crate::cancellation::CancellationToken;
use crate::errors::{CallFailure, EngineError};
use crate::config::RouterConfig;
use crate::jobs::{JobStore, StageRecord};
use crate::provider::ProviderId;
use crate::router::{Router, RouteOutcome, RoutingRequest};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What one stage produced, kept in completion order.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Whether the stage produced a usable output.
    pub ok: bool,
    /// The output, when ok.
    pub output: Option<Value>,
    /// The failure, when not.
    pub failure: Option<CallFailure>,
    /// Winning provider, when a single provider's envelope was used.
    pub provider: Option<ProviderId>,
    /// Whether routing hedged for this stage.
    pub hedged: bool,
    /// Providers dispatched while routing this stage.
    pub attempts: u32,
    /// Observed latency of the winning (or final) envelope.
    pub latency_ms: u64,
}

/// The result of one whole waterfall run.
#[derive(Debug, Clone)]
pub struct WaterfallOutcome {
    /// True exactly when every sink stage produced an output.
    pub ok: bool,
    /// Sink outputs keyed by stage name; failed sinks map to null.
    pub result: Value,
    /// Per-stage results in completion order.
    pub stages: Vec<StageResult>,
    /// The failure that decided a failed run: the first failed sink, or
    /// the first failed stage when no sink failed outright.
    pub failure: Option<CallFailure>,
}

/// Executes validated waterfalls over a router, appending the stage trail
/// to the job store as stages complete.
pub struct WaterfallRunner {
    router: Arc<Router>,
    store: Arc<dyn JobStore>,
    defaults: RouterConfig,
}

impl std::fmt::Debug for WaterfallRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaterfallRunner").finish_non_exhaustive()
    }
}

impl WaterfallRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(router: Arc<Router>, store: Arc<dyn JobStore>, defaults: RouterConfig) -> Self {
        Self {
            router,
            store,
            defaults,
        }
    }

    /// Runs a waterfall for one job.
    ///
    /// Fan-out: every stage whose dependencies have completed is in
    /// flight concurrently. A stage whose hard dependency produced no
    /// output fails without a provider call; soft dependencies run with
    /// the absent inputs marked.
    pub async fn run(
        &self,
        spec: &WaterfallSpec,
        job_id: Uuid,
        key: &str,
        trigger: &Value,
        cancel: &Arc<CancellationToken>,
    ) -> Result<WaterfallOutcome, EngineError> {
        let stage_count = spec.stages().len();
        let mut in_degrees = spec.in_degrees();
        let mut outputs: Vec<Option<Value>> = vec![None; stage_count];
        let mut results: Vec<StageResult> = Vec::with_capacity(stage_count);
        let mut next_seq = u32::try_from(self.store.stage_records(job_id).await?.len())
            .map_err(|_| EngineError::Internal("stage trail overflow".into()))?;

        let mut ready: Vec<usize> = (0..stage_count).filter(|&i| in_degrees[i] == 0).collect();
        let mut running: FuturesUnordered<BoxFuture<'static, (usize, RouteOutcome)>> =
            FuturesUnordered::new();

        loop {
            // Launch everything whose dependencies have settled.
            while let Some(idx) = ready.pop() {
                let stage = &spec.stages()[idx];

                if let Some(missing) = stage.hard_dependencies.iter().find(|dep| {
                    spec.index_of(dep.as_str())
                        .is_some_and(|i| outputs[i].is_none())
                }) {
                    let failure = CallFailure::permanent(format!(
                        "hard dependency '{missing}' produced no output"
                    ));
                    tracing::warn!(
                        job_id = %job_id,
                        stage = %stage.name,
                        missing = %missing,
                        "stage skipped"
                    );
                    let result = StageResult {
                        name: stage.name.clone(),
                        ok: false,
                        output: None,
                        failure: Some(failure),
                        provider: None,
                        hedged: false,
                        attempts: 0,
                        latency_ms: 0,
                    };
                    self.append_record(job_id, stage.role, &result, next_seq)
                        .await?;
                    next_seq += 1;
                    results.push(result);
                    for dependent in spec.dependents_of(&stage.name) {
                        in_degrees[dependent] -= 1;
                        if in_degrees[dependent] == 0 {
                            ready.push(dependent);
                        }
                    }
                    continue;
                }

                let mut inputs = StageInputs::new();
                for dep in &stage.dependencies {
                    if let Some(i) = spec.index_of(dep) {
                        inputs.insert(dep.clone(), outputs[i].clone());
                    }
                }

                let parts = stage.prompt.build(key, trigger, &inputs);
                let prompt_hash = self
                    .store
                    .store_blob(parts.payload.to_string().as_bytes())
                    .await?;
                tracing::debug!(
                    job_id = %job_id,
                    stage = %stage.name,
                    prompt_hash = %prompt_hash,
                    "stage dispatched"
                );

                let mut req = RoutingRequest::new(
                    stage.role,
                    stage.chain.clone(),
                    &self.defaults,
                    parts.system,
                    parts.payload,
                )
                .with_options(stage.options.clone());
                if let Some(ms) = stage.primary_timeout_ms {
                    req = req.with_primary_timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = stage.total_budget_ms {
                    req = req.with_total_budget(Duration::from_millis(ms));
                }

                let router = self.router.clone();
                let token = cancel.clone();
                running.push(Box::pin(async move {
                    (idx, router.route(&req, &token).await)
                }));
            }

            let Some((idx, outcome)) = running.next().await else {
                break;
            };

            let stage = &spec.stages()[idx];
            let failure = (!outcome.is_success()).then(|| outcome.envelope.failure_or_default());
            let mut result = StageResult {
                name: stage.name.clone(),
                ok: outcome.is_success(),
                output: outcome.envelope.output.clone(),
                failure,
                provider: outcome.provider,
                hedged: outcome.hedged,
                attempts: outcome.attempts,
                latency_ms: outcome.envelope.latency_ms,
            };

            if result.ok {
                if let (Some(check), Some(output)) = (&stage.check, &result.output) {
                    if let Err(reason) = check.check(output) {
                        tracing::warn!(
                            job_id = %job_id,
                            stage = %stage.name,
                            reason = %reason,
                            "output check failed"
                        );
                        result.ok = false;
                        result.output = None;
                        result.failure = Some(CallFailure::permanent(format!(
                            "output check failed: {reason}"
                        )));
                    }
                }
            }

            if let Some(output) = &result.output {
                self.store
                    .store_blob(output.to_string().as_bytes())
                    .await?;
            }
            self.append_record(job_id, stage.role, &result, next_seq)
                .await?;
            next_seq += 1;

            outputs[idx] = result.output.clone();
            results.push(result);

            for dependent in spec.dependents_of(&stage.name) {
                in_degrees[dependent] -= 1;
                if in_degrees[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        let sinks = spec.sinks();
        let ok = sinks.iter().all(|&i| outputs[i].is_some());
        let mut sink_outputs = serde_json::Map::new();
        for &i in &sinks {
            sink_outputs.insert(
                spec.stages()[i].name.clone(),
                outputs[i].clone().unwrap_or(Value::Null),
            );
        }

        let failure = if ok {
            None
        } else if cancel.is_cancelled() {
            Some(CallFailure::budget_exhausted(
                cancel.reason().unwrap_or_else(|| "run cancelled".into()),
            ))
        } else {
            let sink_names: Vec<&str> =
                sinks.iter().map(|&i| spec.stages()[i].name.as_str()).collect();
            results
                .iter()
                .find(|r| !r.ok && sink_names.contains(&r.name.as_str()))
                .or_else(|| results.iter().find(|r| !r.ok))
                .and_then(|r| r.failure.clone())
        };

        Ok(WaterfallOutcome {
            ok,
            result: Value::Object(sink_outputs),
            stages: results,
            failure,
        })
    }

    async fn append_record(
        &self,
        job_id: Uuid,
        role: crate::provider::Role,
        result: &StageResult,
        seq: u32,
    ) -> Result<(), EngineError> {
        self.store
            .append_stage_record(StageRecord {
                job_id,
                seq,
                stage: result.name.clone(),
                role,
                provider: result.provider,
                ok: result.ok,
                hedged: result.hedged,
                attempts: result.attempts,
                latency_ms: result.latency_ms,
                tokens: crate::provider::TokenUsage::default(),
                error_code: result.failure.as_ref().map(|f| f.kind.code().to_string()),
                error_message: result.failure.as_ref().map(|f| f.message.clone()),
                output: result.output.clone(),
                recorded_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, RouterState};
    use crate::jobs::InMemoryJobStore;
    use crate::pipeline::{JsonPromptBuilder, PromptBuilder, StageSpec};
    use crate::provider::{ProviderRegistry, Role};
    use crate::testing::{FixedDelayAdapter, ScriptedAdapter, ScriptedReply};
    use pretty_assertions::assert_eq;

    fn prompt() -> Arc<dyn PromptBuilder> {
        Arc::new(JsonPromptBuilder::new("system"))
    }

    fn runner(adapters: Vec<Arc<dyn crate::provider::ProviderAdapter>>) -> (WaterfallRunner, Arc<InMemoryJobStore>) {
        let mut builder = ProviderRegistry::builder();
        for adapter in adapters {
            builder = builder.register(adapter);
        }
        let router = Arc::new(Router::new(
            Arc::new(builder.build()),
            RouterState::new(BreakerConfig::default()),
        ));
        let store = Arc::new(InMemoryJobStore::new());
        (
            WaterfallRunner::new(router, store.clone(), RouterConfig::default()),
            store,
        )
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

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_runs_all_stages() {
        let (runner, store) = runner(vec![Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(50),
        ))]);
        let job_id = Uuid::new_v4();

        let outcome = runner
            .run(
                &triad(),
                job_id,
                "AAPL",
                &serde_json::json!({"depth": 1}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.stages.len(), 3);
        assert!(outcome.result["consolidator"].is_object());

        let trail = store.stage_records(job_id).await.unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(
            trail.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // Leaves complete before the join.
        assert_eq!(trail[2].stage, "consolidator");
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_stages_run_concurrently() {
        let (runner, _) = runner(vec![Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(100),
        ))]);

        let started = tokio::time::Instant::now();
        let outcome = runner
            .run(
                &triad(),
                Uuid::new_v4(),
                "AAPL",
                &serde_json::json!({}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.ok);
        // Two independent 100ms leaves plus one 100ms join: ~200ms, not 300.
        assert!(started.elapsed() < Duration::from_millis(280));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_dependency_failure_skips_downstream() {
        let strategist = Arc::new(ScriptedAdapter::new(
            ProviderId::Anthropic,
            vec![ScriptedReply::permanent_failure("bad output")],
        ));
        let local = Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(10),
        ));
        let spec = WaterfallSpec::builder("triad")
            .stage(StageSpec::new(
                "strategist",
                Role::Strategist,
                vec![ProviderId::Anthropic],
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
            .unwrap();

        let (runner, store) = runner(vec![strategist, local.clone()]);
        let job_id = Uuid::new_v4();
        let outcome = runner
            .run(
                &spec,
                job_id,
                "AAPL",
                &serde_json::json!({}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        let consolidator = outcome
            .stages
            .iter()
            .find(|s| s.name == "consolidator")
            .unwrap();
        assert!(!consolidator.ok);
        assert_eq!(consolidator.attempts, 0);
        assert!(consolidator
            .failure
            .as_ref()
            .unwrap()
            .message
            .contains("hard dependency 'strategist'"));

        // The skipped stage still leaves a record in the trail.
        let trail = store.stage_records(job_id).await.unwrap();
        assert_eq!(trail.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_dependency_failure_still_runs_downstream() {
        let briefer = Arc::new(ScriptedAdapter::new(
            ProviderId::OpenAi,
            vec![ScriptedReply::permanent_failure("briefer down")],
        ));
        let local = Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(10),
        ));
        let spec = WaterfallSpec::builder("triad")
            .stage(StageSpec::new(
                "strategist",
                Role::Strategist,
                vec![ProviderId::Local],
                prompt(),
            ))
            .stage(StageSpec::new(
                "briefer",
                Role::Briefer,
                vec![ProviderId::OpenAi],
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
            .unwrap();

        let (runner, _) = runner(vec![briefer, local]);
        let outcome = runner
            .run(
                &spec,
                Uuid::new_v4(),
                "AAPL",
                &serde_json::json!({}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The sink ran despite the soft failure, so the job is ok.
        assert!(outcome.ok);
        let consolidator = outcome
            .stages
            .iter()
            .find(|s| s.name == "consolidator")
            .unwrap();
        assert!(consolidator.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sink_fails_the_run() {
        let spec = WaterfallSpec::builder("single")
            .stage(StageSpec::new(
                "planner",
                Role::Planner,
                vec![ProviderId::Anthropic],
                prompt(),
            ))
            .build()
            .unwrap();
        let (runner, _) = runner(vec![Arc::new(ScriptedAdapter::new(
            ProviderId::Anthropic,
            vec![ScriptedReply::permanent_failure("refused")],
        ))]);

        let outcome = runner
            .run(
                &spec,
                Uuid::new_v4(),
                "AAPL",
                &serde_json::json!({}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.result["planner"], Value::Null);
        assert_eq!(
            outcome.failure.unwrap().kind,
            crate::errors::FailureKind::Permanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_check_downgrades_success_to_permanent() {
        let spec = WaterfallSpec::builder("plan")
            .stage(
                StageSpec::new("planner", Role::Planner, vec![ProviderId::Local], prompt())
                    .with_check(Arc::new(crate::pipeline::RequiredKeysCheck::new(vec![
                        "plan",
                    ]))),
            )
            .build()
            .unwrap();
        // The adapter succeeds, but its output has no "plan" key.
        let (runner, _) = runner(vec![Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(10),
        ))]);

        let outcome = runner
            .run(
                &spec,
                Uuid::new_v4(),
                "AAPL",
                &serde_json::json!({}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, crate::errors::FailureKind::Permanent);
        assert!(failure.message.contains("output check failed"));
    }
}
