//! Test doubles shared across the engine's test suites.
//!
//! Exported from the crate (not hidden behind `cfg(test)`) so downstream
//! users can drive the engine in their own tests without real providers.

use crate::cancellation::CancellationToken;
use crate::errors::CallFailure;
use crate::notify::NotificationEvent;
use crate::provider::{ProviderAdapter, ProviderCall, ProviderEnvelope, ProviderId, TokenUsage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Adapter that always succeeds after a fixed delay.
///
/// The delay is cancellation-aware: a cancelled call returns a transient
/// failure without waiting out the full delay.
#[derive(Debug)]
pub struct FixedDelayAdapter {
    id: ProviderId,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedDelayAdapter {
    /// Creates an adapter for `id` that completes after `delay`.
    #[must_use]
    pub const fn new(id: ProviderId, delay: Duration) -> Self {
        Self {
            id,
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls dispatched to this adapter.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for FixedDelayAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn call(&self, call: &ProviderCall, cancel: &Arc<CancellationToken>) -> ProviderEnvelope {
        self.calls.fetch_add(1, Ordering::SeqCst);

        tokio::select! {
            () = tokio::time::sleep(self.delay) => {
                let latency = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX);
                ProviderEnvelope::success(
                    serde_json::json!({
                        "provider": self.id.as_str(),
                        "role": call.role.as_str(),
                        "text": "ok",
                    }),
                    latency,
                    TokenUsage::new(100, 50),
                )
            }
            () = cancel.cancelled() => {
                ProviderEnvelope::failure(CallFailure::transient("call cancelled"), 0)
            }
        }
    }
}

/// One scripted response from a [`ScriptedAdapter`].
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    delay: Duration,
    outcome: Result<serde_json::Value, CallFailure>,
}

impl ScriptedReply {
    /// An immediate success with the given output.
    #[must_use]
    pub const fn success(output: serde_json::Value) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Ok(output),
        }
    }

    /// A success delivered after a delay.
    #[must_use]
    pub const fn success_after(delay: Duration, output: serde_json::Value) -> Self {
        Self {
            delay,
            outcome: Ok(output),
        }
    }

    /// An immediate transient failure.
    #[must_use]
    pub fn transient_failure(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(CallFailure::transient(message)),
        }
    }

    /// An immediate permanent failure.
    #[must_use]
    pub fn permanent_failure(message: impl Into<String>) -> Self {
        Self {
            delay: Duration::ZERO,
            outcome: Err(CallFailure::permanent(message)),
        }
    }

    /// A failure delivered after a delay.
    #[must_use]
    pub const fn failure_after(delay: Duration, failure: CallFailure) -> Self {
        Self {
            delay,
            outcome: Err(failure),
        }
    }
}

/// Adapter that replays a script of replies in order.
///
/// Once the script is exhausted it keeps returning an immediate success,
/// which makes retry tests read naturally: script the failures, let the
/// recovery be implicit.
#[derive(Debug)]
pub struct ScriptedAdapter {
    id: ProviderId,
    script: Mutex<VecDeque<ScriptedReply>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    /// Creates an adapter for `id` with the given script.
    #[must_use]
    pub fn new(id: ProviderId, script: Vec<ScriptedReply>) -> Self {
        Self {
            id,
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls dispatched to this adapter.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn call(&self, call: &ProviderCall, cancel: &Arc<CancellationToken>) -> ProviderEnvelope {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.script.lock().pop_front();

        let Some(reply) = reply else {
            return ProviderEnvelope::success(
                serde_json::json!({
                    "provider": self.id.as_str(),
                    "role": call.role.as_str(),
                    "text": "ok",
                }),
                0,
                TokenUsage::new(100, 50),
            );
        };

        if !reply.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(reply.delay) => {}
                () = cancel.cancelled() => {
                    return ProviderEnvelope::failure(
                        CallFailure::transient("call cancelled"),
                        0,
                    );
                }
            }
        }

        let latency = u64::try_from(reply.delay.as_millis()).unwrap_or(u64::MAX);
        match reply.outcome {
            Ok(output) => ProviderEnvelope::success(output, latency, TokenUsage::new(100, 50)),
            Err(failure) => ProviderEnvelope::failure(failure, latency),
        }
    }
}

/// Background collector for notification events.
///
/// Drains a broadcast receiver into a buffer so tests can assert on
/// everything published so far without racing the publisher.
#[derive(Debug)]
pub struct CollectingSubscriber {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CollectingSubscriber {
    /// Spawns a collector over a receiver.
    #[must_use]
    pub fn spawn(mut receiver: broadcast::Receiver<NotificationEvent>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self { events, handle }
    }

    /// Snapshot of everything collected so far.
    #[must_use]
    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().clone()
    }
}

impl Drop for CollectingSubscriber {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
