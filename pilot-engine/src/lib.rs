//! # Pilot Engine
//!
//! A multi-provider orchestration engine for generative pipelines.
//!
//! The engine routes each pipeline stage across an ordered fallback
//! chain of providers with:
//!
//! - **Hedged routing**: a slow primary gets a concurrent hedge rather
//!   than being cancelled; the first success wins
//! - **Circuit breaking**: per-provider breakers short-circuit known-bad
//!   providers and probe recovery with a single trial call
//! - **Waterfall pipelines**: validated DAGs of stages with fan-out,
//!   fan-in, and hard/soft dependency semantics
//! - **Durable jobs**: triggers coalesce onto active jobs, failures are
//!   retried on a backoff schedule, and every stage leaves a record
//! - **At-least-once notifications**: terminal transitions are persisted
//!   and pushed over an in-process broadcast channel
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use pilot_engine::prelude::*;
//!
//! let engine = Engine::builder()
//!     .with_registry(registry)
//!     .register_pipeline(triad_waterfall()?)
//!     .build()?;
//!
//! let trigger = engine.trigger("AAPL", "triad", payload).await?;
//! let status = engine.run_job(trigger.job_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod breaker;
pub mod cancellation;
pub mod config;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod router;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{Admission, BreakerConfig, CircuitState, RouterState};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{EngineConfig, RouterConfig};
    pub use crate::engine::{Engine, EngineBuilder, JobStatusView, Trigger, TriggerStatus};
    pub use crate::errors::{
        CallFailure, CycleDetectedError, EngineError, FailureKind, WaterfallValidationError,
    };
    pub use crate::jobs::{
        CreateOutcome, InMemoryJobStore, JobStatus, JobStore, NotificationRecord,
        PerformanceSnapshot, PipelineJob, SqliteJobStore, StageRecord,
    };
    pub use crate::notify::{DedupSubscriber, NotificationBus, NotificationEvent};
    pub use crate::pipeline::{
        JsonPromptBuilder, OutputCheck, PromptBuilder, PromptParts, RequiredKeysCheck,
        StageInputs, StageSpec, WaterfallOutcome, WaterfallRunner, WaterfallSpec,
    };
    pub use crate::provider::{
        CallOptions, ProviderAdapter, ProviderCall, ProviderEnvelope, ProviderId,
        ProviderRegistry, Role, TokenUsage,
    };
    pub use crate::retry::{BackoffStrategy, JitterStrategy, RetryPolicy};
    pub use crate::router::{RouteOutcome, Router, RoutingRequest};
}
