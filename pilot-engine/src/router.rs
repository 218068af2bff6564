//! Routing across providers with hedging, fallback chains, and budgets.
//!
//! A [`RoutingRequest`] names an ordered fallback chain. The router calls
//! the first provider whose breaker admits it; if no result arrives within
//! the primary timeout it hedges the next provider concurrently, without
//! cancelling the one already in flight. The first successful completion
//! wins, losers are cancelled best-effort, and the whole attempt is
//! bounded by a total budget that can never be converted into a success.

use crate::breaker::{Admission, RouterState};
use crate::cancellation::CancellationToken;
use crate::config::RouterConfig;
use crate::errors::{CallFailure, FailureKind};
use crate::provider::{
    CallOptions, ProviderCall, ProviderEnvelope, ProviderId, ProviderRegistry, Role,
};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// One routing invocation. Immutable once built.
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    /// The role being served.
    pub role: Role,
    /// Ordered fallback chain; order encodes quality/cost preference.
    pub chain: Vec<ProviderId>,
    /// How long to wait on the current provider before hedging the next.
    pub primary_timeout: Duration,
    /// Hard bound on the whole attempt.
    pub total_budget: Duration,
    /// System prompt for the role.
    pub system_prompt: String,
    /// Opaque payload forwarded to the adapter.
    pub payload: serde_json::Value,
    /// Generation parameters.
    pub options: CallOptions,
}

impl RoutingRequest {
    /// Creates a request with timing taken from a [`RouterConfig`].
    #[must_use]
    pub fn new(
        role: Role,
        chain: Vec<ProviderId>,
        config: &RouterConfig,
        system_prompt: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            role,
            chain,
            primary_timeout: config.primary_timeout(),
            total_budget: config.total_budget(),
            system_prompt: system_prompt.into(),
            payload,
            options: CallOptions::default(),
        }
    }

    /// Overrides the primary timeout.
    #[must_use]
    pub const fn with_primary_timeout(mut self, timeout: Duration) -> Self {
        self.primary_timeout = timeout;
        self
    }

    /// Overrides the total budget.
    #[must_use]
    pub const fn with_total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = budget;
        self
    }

    /// Sets the call options.
    #[must_use]
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

/// The result of one routing attempt.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// The provider whose envelope was used, if any single provider's was.
    pub provider: Option<ProviderId>,
    /// The winning envelope, or the failure after chain exhaustion.
    pub envelope: ProviderEnvelope,
    /// Whether a hedge call was issued.
    pub hedged: bool,
    /// Providers actually dispatched (short-circuited ones not counted).
    pub attempts: u32,
}

impl RouteOutcome {
    /// Returns true if the attempt produced a usable output.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.envelope.ok
    }
}

struct Flight {
    provider: ProviderId,
    trial: bool,
    token: Arc<CancellationToken>,
}

/// Provider router with hedging and fallback.
pub struct Router {
    registry: Arc<ProviderRegistry>,
    state: RouterState,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl Router {
    /// Creates a router over a registry with an injected breaker state.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, state: RouterState) -> Self {
        Self { registry, state }
    }

    /// Read access to the breaker state, for inspection and tests.
    #[must_use]
    pub const fn state(&self) -> &RouterState {
        &self.state
    }

    /// Executes one routing attempt.
    ///
    /// `parent` is the caller's cancellation scope (typically the job
    /// budget); when it fires, in-flight calls are cancelled and a
    /// budget-exhausted failure is returned.
    pub async fn route(
        &self,
        req: &RoutingRequest,
        parent: &Arc<CancellationToken>,
    ) -> RouteOutcome {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + req.total_budget;

        let mut inflight: FuturesUnordered<JoinHandle<(usize, ProviderEnvelope)>> =
            FuturesUnordered::new();
        let mut flights: HashMap<usize, Flight> = HashMap::new();
        let mut next_idx = 0usize;
        let mut attempts = 0u32;
        let mut hedged = false;
        let mut last_failure = CallFailure::circuit_open("no provider in the chain was available");

        if !self.launch_next(req, &mut next_idx, &mut inflight, &mut flights, &mut last_failure) {
            return RouteOutcome {
                provider: None,
                envelope: ProviderEnvelope::failure(last_failure, elapsed_ms(started)),
                hedged: false,
                attempts,
            };
        }
        attempts += 1;
        let mut hedge_at = tokio::time::Instant::now() + req.primary_timeout;

        loop {
            tokio::select! {
                biased;

                () = parent.cancelled() => {
                    let reason = parent
                        .reason()
                        .unwrap_or_else(|| "routing cancelled".to_string());
                    self.cancel_flights(&mut flights, &reason);
                    return RouteOutcome {
                        provider: None,
                        envelope: ProviderEnvelope::failure(
                            CallFailure::budget_exhausted(reason),
                            elapsed_ms(started),
                        ),
                        hedged,
                        attempts,
                    };
                }

                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(role = %req.role, "routing budget exhausted");
                    self.cancel_flights(&mut flights, "total budget exhausted");
                    return RouteOutcome {
                        provider: None,
                        envelope: ProviderEnvelope::failure(
                            CallFailure::budget_exhausted(format!(
                                "no provider succeeded within {}ms",
                                req.total_budget.as_millis()
                            )),
                            elapsed_ms(started),
                        ),
                        hedged,
                        attempts,
                    };
                }

                () = tokio::time::sleep_until(hedge_at), if next_idx < req.chain.len() => {
                    if self.launch_next(
                        req, &mut next_idx, &mut inflight, &mut flights, &mut last_failure,
                    ) {
                        tracing::debug!(role = %req.role, "hedge call issued");
                        attempts += 1;
                        hedged = true;
                    }
                    hedge_at = tokio::time::Instant::now() + req.primary_timeout;
                }

                completed = inflight.next() => {
                    let Some(result) = completed else {
                        // All flights resolved without a verdict we kept.
                        return RouteOutcome {
                            provider: None,
                            envelope: ProviderEnvelope::failure(
                                last_failure,
                                elapsed_ms(started),
                            ),
                            hedged,
                            attempts,
                        };
                    };

                    let Ok((idx, envelope)) = result else {
                        tracing::error!(role = %req.role, "provider task panicked");
                        if inflight.is_empty()
                            && !self.launch_next(
                                req, &mut next_idx, &mut inflight, &mut flights,
                                &mut last_failure,
                            )
                        {
                            return RouteOutcome {
                                provider: None,
                                envelope: ProviderEnvelope::failure(
                                    last_failure,
                                    elapsed_ms(started),
                                ),
                                hedged,
                                attempts,
                            };
                        }
                        continue;
                    };

                    if envelope.ok {
                        let (win_idx, win_env) =
                            self.pick_winner(idx, envelope, &mut inflight, &mut flights);
                        self.cancel_flights(&mut flights, "hedging loser");
                        return RouteOutcome {
                            provider: Some(req.chain[win_idx]),
                            envelope: win_env,
                            hedged,
                            attempts,
                        };
                    }

                    let failure = envelope.failure_or_default();
                    self.settle(&mut flights, idx, false);

                    if failure.kind == FailureKind::Permanent {
                        // Retrying a malformed contract elsewhere is
                        // unlikely to help; abort the chain.
                        self.cancel_flights(&mut flights, "permanent failure");
                        return RouteOutcome {
                            provider: Some(req.chain[idx]),
                            envelope,
                            hedged,
                            attempts,
                        };
                    }

                    tracing::debug!(
                        role = %req.role,
                        provider = %req.chain[idx],
                        error = %failure,
                        "provider attempt failed"
                    );
                    last_failure = failure;

                    if inflight.is_empty() {
                        if self.launch_next(
                            req, &mut next_idx, &mut inflight, &mut flights, &mut last_failure,
                        ) {
                            attempts += 1;
                            hedge_at = tokio::time::Instant::now() + req.primary_timeout;
                        } else {
                            return RouteOutcome {
                                provider: Some(req.chain[idx]),
                                envelope: ProviderEnvelope::failure(
                                    last_failure,
                                    elapsed_ms(started),
                                ),
                                hedged,
                                attempts,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Launches the next admissible provider in the chain.
    ///
    /// Providers whose breakers are Open are skipped, leaving a
    /// `circuit_open` failure behind. Returns false when the chain is
    /// exhausted.
    fn launch_next(
        &self,
        req: &RoutingRequest,
        next_idx: &mut usize,
        inflight: &mut FuturesUnordered<JoinHandle<(usize, ProviderEnvelope)>>,
        flights: &mut HashMap<usize, Flight>,
        last_failure: &mut CallFailure,
    ) -> bool {
        while *next_idx < req.chain.len() {
            let idx = *next_idx;
            *next_idx += 1;
            let provider = req.chain[idx];

            let Some(adapter) = self.registry.adapter(provider) else {
                *last_failure =
                    CallFailure::transient(format!("provider {provider} is not registered"));
                continue;
            };

            let trial = match self.state.admit(provider) {
                Admission::Allowed => false,
                Admission::Trial => true,
                Admission::ShortCircuit => {
                    *last_failure =
                        CallFailure::circuit_open(format!("circuit open for {provider}"));
                    continue;
                }
            };

            let token = CancellationToken::new();
            let child = token.clone();
            let registry = self.registry.clone();
            let call = ProviderCall {
                role: req.role,
                system_prompt: req.system_prompt.clone(),
                payload: req.payload.clone(),
                options: req.options.clone(),
            };

            let handle = tokio::spawn(async move {
                let _permit = registry.acquire_slot(provider).await;
                if child.is_cancelled() {
                    return (
                        idx,
                        ProviderEnvelope::failure(
                            CallFailure::transient("cancelled before dispatch"),
                            0,
                        ),
                    );
                }
                (idx, adapter.call(&call, &child).await)
            });

            flights.insert(
                idx,
                Flight {
                    provider,
                    trial,
                    token,
                },
            );
            inflight.push(handle);
            return true;
        }
        false
    }

    /// Chooses the winner among the first success and any completions that
    /// are already queued: the provider earliest in the chain wins a tie.
    fn pick_winner(
        &self,
        first_idx: usize,
        first_env: ProviderEnvelope,
        inflight: &mut FuturesUnordered<JoinHandle<(usize, ProviderEnvelope)>>,
        flights: &mut HashMap<usize, Flight>,
    ) -> (usize, ProviderEnvelope) {
        self.settle(flights, first_idx, true);
        let mut winner = (first_idx, first_env);

        loop {
            match inflight.next().now_or_never() {
                Some(Some(Ok((idx, envelope)))) => {
                    self.settle(flights, idx, envelope.ok);
                    if envelope.ok && idx < winner.0 {
                        winner = (idx, envelope);
                    }
                }
                Some(Some(Err(_))) => {}
                Some(None) | None => break,
            }
        }

        winner
    }

    /// Records a breaker verdict for a completed flight.
    fn settle(&self, flights: &mut HashMap<usize, Flight>, idx: usize, success: bool) {
        if let Some(flight) = flights.remove(&idx) {
            if success {
                self.state.record_success(flight.provider);
            } else if !flight.token.is_cancelled() {
                self.state.record_failure(flight.provider);
            } else if flight.trial {
                // A cancelled trial produced no verdict.
                self.state.abandon_trial(flight.provider);
            }
        }
    }

    /// Cancels all remaining flights, best-effort and without waiting.
    fn cancel_flights(&self, flights: &mut HashMap<usize, Flight>, reason: &str) {
        for (_, flight) in flights.drain() {
            flight.token.cancel(reason.to_string());
            if flight.trial {
                self.state.abandon_trial(flight.provider);
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
