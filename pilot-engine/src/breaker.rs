//! Per-provider circuit breaking.
//!
//! Each provider has a [`ProviderProfile`] tracking its circuit state and
//! consecutive-failure counter. Profiles are owned by a [`RouterState`]
//! value injected into the router rather than ambient shared state, so a
//! fresh state per test is trivial.
//!
//! The breaker is per provider, not per role: the same provider may serve
//! several roles and its health is a property of the provider.

use crate::provider::ProviderId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls allowed; failures counted.
    #[default]
    Closed,
    /// Calls short-circuited without a network attempt.
    Open,
    /// Exactly one trial call allowed after cooldown.
    HalfOpen,
}

/// Breaker configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip Closed -> Open.
    pub failure_threshold: u32,
    /// Cooldown before an Open breaker allows a trial call.
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub const fn with_cooldown_ms(mut self, cooldown_ms: u64) -> Self {
        self.cooldown_ms = cooldown_ms;
        self
    }

    const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Health profile for one provider.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    /// Current circuit state.
    pub state: CircuitState,
    /// Consecutive failures observed while Closed.
    pub consecutive_failures: u32,
    /// When an Open breaker may admit a trial call.
    pub cooldown_until: Option<Instant>,
    /// Whether the single HalfOpen trial is currently in flight.
    pub trial_in_flight: bool,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown_until: None,
            trial_in_flight: false,
        }
    }
}

/// Verdict of asking the breaker whether a provider may be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The breaker is Closed; call normally.
    Allowed,
    /// The breaker is HalfOpen; this call is the single trial.
    Trial,
    /// The breaker is Open; short-circuit with `circuit_open`.
    ShortCircuit,
}

/// Explicit, injectable breaker state for all providers.
#[derive(Debug)]
pub struct RouterState {
    config: BreakerConfig,
    profiles: Mutex<HashMap<ProviderId, ProviderProfile>>,
}

impl RouterState {
    /// Creates a fresh state with all breakers Closed.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
        }
    }

    /// Asks whether `provider` may be called right now.
    ///
    /// An Open breaker transitions to HalfOpen lazily here once its
    /// cooldown has passed; the caller that observes the transition owns
    /// the trial call.
    pub fn admit(&self, provider: ProviderId) -> Admission {
        let mut profiles = self.profiles.lock();
        let profile = profiles.entry(provider).or_default();

        match profile.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let expired = profile
                    .cooldown_until
                    .map_or(true, |until| Instant::now() >= until);
                if expired {
                    profile.state = CircuitState::HalfOpen;
                    profile.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::ShortCircuit
                }
            }
            CircuitState::HalfOpen => {
                if profile.trial_in_flight {
                    Admission::ShortCircuit
                } else {
                    profile.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, provider: ProviderId) {
        let mut profiles = self.profiles.lock();
        let profile = profiles.entry(provider).or_default();

        match profile.state {
            CircuitState::HalfOpen => {
                tracing::info!(provider = %provider, "circuit closed after trial success");
                profile.state = CircuitState::Closed;
                profile.consecutive_failures = 0;
                profile.cooldown_until = None;
                profile.trial_in_flight = false;
            }
            CircuitState::Closed => {
                profile.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call that was actually attempted.
    ///
    /// Circuit-open short-circuits must not be reported here; nothing was
    /// attempted against the provider.
    pub fn record_failure(&self, provider: ProviderId) {
        let mut profiles = self.profiles.lock();
        let profile = profiles.entry(provider).or_default();

        match profile.state {
            CircuitState::Closed => {
                profile.consecutive_failures += 1;
                if profile.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        provider = %provider,
                        failures = profile.consecutive_failures,
                        "circuit opened"
                    );
                    profile.state = CircuitState::Open;
                    profile.cooldown_until = Some(Instant::now() + self.config.cooldown());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(provider = %provider, "trial failed, circuit re-opened");
                profile.state = CircuitState::Open;
                profile.cooldown_until = Some(Instant::now() + self.config.cooldown());
                profile.trial_in_flight = false;
            }
            CircuitState::Open => {}
        }
    }

    /// Releases a HalfOpen trial whose call was cancelled before a
    /// verdict, so a later caller may run another trial.
    pub fn abandon_trial(&self, provider: ProviderId) {
        let mut profiles = self.profiles.lock();
        if let Some(profile) = profiles.get_mut(&provider) {
            if profile.state == CircuitState::HalfOpen {
                profile.trial_in_flight = false;
            }
        }
    }

    /// Returns the current circuit state for a provider.
    #[must_use]
    pub fn state_of(&self, provider: ProviderId) -> CircuitState {
        self.profiles
            .lock()
            .get(&provider)
            .map_or(CircuitState::Closed, |p| p.state)
    }

    /// Returns a snapshot of a provider's profile.
    #[must_use]
    pub fn profile(&self, provider: ProviderId) -> ProviderProfile {
        self.profiles
            .lock()
            .get(&provider)
            .cloned()
            .unwrap_or_default()
    }
}
