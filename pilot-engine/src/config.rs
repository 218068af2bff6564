//! Engine configuration.
//!
//! One serde-friendly tree of plain values with builder-style setters.
//! Nothing here reads the environment; callers deserialize or construct
//! the config and hand it to [`crate::engine::Engine`].

use crate::breaker::BreakerConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Router timing defaults, overridable per stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterConfig {
    /// How long to wait on the current provider before hedging the next
    /// one, in milliseconds.
    pub primary_timeout_ms: u64,
    /// Hard bound on one whole routing attempt, in milliseconds.
    pub total_budget_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary_timeout_ms: 1200,
            total_budget_ms: 10_000,
        }
    }
}

impl RouterConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary timeout.
    #[must_use]
    pub const fn with_primary_timeout_ms(mut self, ms: u64) -> Self {
        self.primary_timeout_ms = ms;
        self
    }

    /// Sets the total routing budget.
    #[must_use]
    pub const fn with_total_budget_ms(mut self, ms: u64) -> Self {
        self.total_budget_ms = ms;
        self
    }

    /// The primary timeout as a [`Duration`].
    #[must_use]
    pub const fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    /// The total budget as a [`Duration`].
    #[must_use]
    pub const fn total_budget(&self) -> Duration {
        Duration::from_millis(self.total_budget_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Router timing defaults.
    pub router: RouterConfig,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Job retry schedule.
    pub retry: RetryPolicy,
    /// Hard bound on one whole pipeline run, in milliseconds.
    pub job_budget_ms: u64,
    /// Notification channel name for terminal job transitions.
    pub channel: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            job_budget_ms: 60_000,
            channel: "pipeline.status".to_string(),
        }
    }
}

impl EngineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the router config.
    #[must_use]
    pub const fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Sets the breaker config.
    #[must_use]
    pub const fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the job budget.
    #[must_use]
    pub const fn with_job_budget_ms(mut self, ms: u64) -> Self {
        self.job_budget_ms = ms;
        self
    }

    /// Sets the notification channel name.
    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// The job budget as a [`Duration`].
    #[must_use]
    pub const fn job_budget(&self) -> Duration {
        Duration::from_millis(self.job_budget_ms)
    }
}
