//! End-to-end runs through the engine facade: real registry, real store,
//! scripted adapters.

use crate::breaker::{BreakerConfig, CircuitState};
use crate::config::{EngineConfig, RouterConfig};
use crate::engine::Engine;
use crate::jobs::{JobStatus, SqliteJobStore};
use crate::pipeline::{JsonPromptBuilder, PromptBuilder, StageSpec, WaterfallSpec};
use crate::provider::{ProviderAdapter, ProviderId, ProviderRegistry, Role};
use crate::testing::{CollectingSubscriber, FixedDelayAdapter, ScriptedAdapter, ScriptedReply};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn prompt() -> Arc<dyn PromptBuilder> {
    Arc::new(JsonPromptBuilder::new("system"))
}

fn triad(chain: Vec<ProviderId>) -> WaterfallSpec {
    WaterfallSpec::builder("triad")
        .stage(StageSpec::new(
            "strategist",
            Role::Strategist,
            chain.clone(),
            prompt(),
        ))
        .stage(StageSpec::new(
            "briefer",
            Role::Briefer,
            chain.clone(),
            prompt(),
        ))
        .stage(
            StageSpec::new("consolidator", Role::Consolidator, chain, prompt())
                .with_dependencies(vec!["strategist", "briefer"])
                .with_hard_dependencies(vec!["strategist"]),
        )
        .build()
        .expect("valid triad")
}

fn engine_with(
    adapters: Vec<Arc<dyn ProviderAdapter>>,
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
async fn test_slow_primary_is_hedged_through_a_whole_run() {
    init_tracing();
    let slow_primary = Arc::new(FixedDelayAdapter::new(
        ProviderId::Anthropic,
        Duration::from_millis(5000),
    ));
    let fast_fallback = Arc::new(FixedDelayAdapter::new(
        ProviderId::OpenAi,
        Duration::from_millis(200),
    ));
    let engine = engine_with(
        vec![slow_primary.clone(), fast_fallback.clone()],
        EngineConfig::default()
            .with_router(RouterConfig::new().with_primary_timeout_ms(1000)),
        triad(vec![ProviderId::Anthropic, ProviderId::OpenAi]),
    );

    let trigger = engine
        .trigger("AAPL", "triad", serde_json::json!({"depth": 2}))
        .await
        .unwrap();
    let status = engine.run_job(trigger.job_id).await.unwrap();
    assert_eq!(status, JobStatus::Ok);

    let view = engine.job_status(trigger.job_id).await.unwrap();
    assert_eq!(view.stages.len(), 3);
    for record in &view.stages {
        assert_eq!(record.provider, Some(ProviderId::OpenAi));
        assert!(record.hedged, "stage {} should have hedged", record.stage);
        assert_eq!(record.attempts, 2);
    }
    // The slow primary was dispatched every time, never pre-empted.
    assert_eq!(slow_primary.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_trip_the_breaker_across_jobs() {
    init_tracing();
    let failing = Arc::new(ScriptedAdapter::new(
        ProviderId::Anthropic,
        vec![
            ScriptedReply::transient_failure("503"),
            ScriptedReply::transient_failure("503"),
            ScriptedReply::transient_failure("503"),
        ],
    ));
    let healthy = Arc::new(FixedDelayAdapter::new(
        ProviderId::Local,
        Duration::from_millis(10),
    ));
    let engine = engine_with(
        vec![failing.clone(), healthy],
        EngineConfig::default().with_breaker(
            BreakerConfig::new()
                .with_failure_threshold(3)
                .with_cooldown_ms(600_000),
        ),
        WaterfallSpec::builder("plan")
            .stage(StageSpec::new(
                "planner",
                Role::Planner,
                vec![ProviderId::Anthropic, ProviderId::Local],
                prompt(),
            ))
            .build()
            .unwrap(),
    );

    // Three jobs fall back to the healthy provider and each record a
    // failure against the flaky one.
    for key in ["AAPL", "MSFT", "GOOG"] {
        let trigger = engine.trigger(key, "plan", serde_json::json!({})).await.unwrap();
        assert_eq!(engine.run_job(trigger.job_id).await.unwrap(), JobStatus::Ok);
    }
    assert_eq!(
        engine.router().state().state_of(ProviderId::Anthropic),
        CircuitState::Open
    );
    assert_eq!(failing.calls(), 3);

    // While the breaker is open the flaky provider sees no traffic.
    let trigger = engine.trigger("NVDA", "plan", serde_json::json!({})).await.unwrap();
    assert_eq!(engine.run_job(trigger.job_id).await.unwrap(), JobStatus::Ok);
    assert_eq!(failing.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_sqlite_backed_run_persists_trail_and_metrics() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteJobStore::open(dir.path().join("jobs.db")).unwrap());

    let mut builder = ProviderRegistry::builder();
    builder = builder.register(Arc::new(FixedDelayAdapter::new(
        ProviderId::Local,
        Duration::from_millis(25),
    )));
    let engine = Engine::builder()
        .with_registry(Arc::new(builder.build()))
        .with_store(store)
        .register_pipeline(triad(vec![ProviderId::Local]))
        .build()
        .unwrap();

    let trigger = engine
        .trigger("AAPL", "triad", serde_json::json!({"depth": 1}))
        .await
        .unwrap();
    assert_eq!(engine.run_job(trigger.job_id).await.unwrap(), JobStatus::Ok);

    let view = engine.job_status(trigger.job_id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Ok);
    assert_eq!(view.stages.len(), 3);

    let snapshot = engine.performance_snapshot().await.unwrap();
    let local = snapshot.providers[&ProviderId::Local];
    assert_eq!(local.calls, 3);
    assert_eq!(local.failures, 0);

    let persisted = engine.missed_notifications().await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].status, JobStatus::Ok);
}

#[tokio::test(start_paused = true)]
async fn test_pushed_events_match_persisted_notifications() {
    init_tracing();
    let engine = engine_with(
        vec![Arc::new(FixedDelayAdapter::new(
            ProviderId::Local,
            Duration::from_millis(10),
        ))],
        EngineConfig::default(),
        WaterfallSpec::builder("plan")
            .stage(StageSpec::new(
                "planner",
                Role::Planner,
                vec![ProviderId::Local],
                prompt(),
            ))
            .build()
            .unwrap(),
    );
    let collector = CollectingSubscriber::spawn(engine.subscribe());

    let ok_job = engine.trigger("AAPL", "plan", serde_json::json!({})).await.unwrap();
    engine.run_job(ok_job.job_id).await.unwrap();

    // Let the collector task drain the channel.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let pushed = collector.events();
    let persisted = engine.missed_notifications().await.unwrap();
    assert_eq!(pushed.len(), persisted.len());
    assert_eq!(pushed[0].key, persisted[0].key);
    assert_eq!(pushed[0].status, persisted[0].status);
}
