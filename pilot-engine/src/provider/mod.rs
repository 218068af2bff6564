//! Provider adapters and the uniform call contract.
//!
//! Every external generative service is wrapped in a [`ProviderAdapter`]
//! that normalizes responses into a [`ProviderEnvelope`]. Adapters never
//! raise past their boundary: failures are data, so the router can make
//! routing decisions without exception machinery leaking across layers.

mod registry;

pub use registry::{ProviderRegistry, ProviderRegistryBuilder};

use crate::cancellation::CancellationToken;
use crate::errors::CallFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// The closed set of provider identities.
///
/// Adding a provider is a compile-time-checked enumeration change; there
/// is no string-keyed dynamic dispatch anywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// Anthropic-hosted models.
    Anthropic,
    /// OpenAI-hosted models.
    OpenAi,
    /// Google-hosted models.
    Google,
    /// A locally-hosted model endpoint.
    Local,
}

impl ProviderId {
    /// All provider variants, in no particular preference order.
    pub const ALL: [Self; 4] = [Self::Anthropic, Self::OpenAi, Self::Google, Self::Local];

    /// Returns the stable string form used in persisted rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Local => "local",
        }
    }

    /// Parses the stable string form.
    #[must_use]
    pub fn from_str_opt(value: &str) -> Option<Self> {
        match value {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "google" => Some(Self::Google),
            "local" => Some(Self::Local),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline role a call is made on behalf of.
///
/// Roles are orthogonal to providers: the same provider may serve several
/// roles, which is why circuit state is tracked per provider, not per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Market/context analysis.
    Strategist,
    /// Short situational briefing.
    Briefer,
    /// Merges upstream outputs into one view.
    Consolidator,
    /// Produces the final structured plan.
    Planner,
}

impl Role {
    /// Returns the stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strategist => "strategist",
            Self::Briefer => "briefer",
            Self::Consolidator => "consolidator",
            Self::Planner => "planner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation parameters for a single call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallOptions {
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Per-call timeout enforced by the adapter itself, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.7,
            timeout_ms: 30_000,
        }
    }
}

impl CallOptions {
    /// Sets the maximum output tokens.
    #[must_use]
    pub const fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// One provider invocation, immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCall {
    /// The role this call serves.
    pub role: Role,
    /// System prompt for the role.
    pub system_prompt: String,
    /// Opaque user payload; the engine never inspects its shape.
    pub payload: serde_json::Value,
    /// Generation parameters.
    pub options: CallOptions,
}

impl ProviderCall {
    /// Creates a new call with default options.
    #[must_use]
    pub fn new(role: Role, system_prompt: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            role,
            system_prompt: system_prompt.into(),
            payload,
            options: CallOptions::default(),
        }
    }

    /// Sets the call options.
    #[must_use]
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }
}

/// Token accounting for a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input: u32,
    /// Completion tokens.
    pub output: u32,
}

impl TokenUsage {
    /// Creates a new usage record.
    #[must_use]
    pub const fn new(input: u32, output: u32) -> Self {
        Self { input, output }
    }

    /// Returns total tokens.
    #[must_use]
    pub const fn total(self) -> u32 {
        self.input + self.output
    }
}

/// The uniform success/failure envelope returned by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEnvelope {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Output payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallFailure>,
    /// Observed latency in milliseconds.
    pub latency_ms: u64,
    /// Token accounting.
    #[serde(default)]
    pub tokens: TokenUsage,
}

impl ProviderEnvelope {
    /// Creates a success envelope.
    #[must_use]
    pub fn success(output: serde_json::Value, latency_ms: u64, tokens: TokenUsage) -> Self {
        Self {
            ok: true,
            output: Some(output),
            error: None,
            latency_ms,
            tokens,
        }
    }

    /// Creates a failure envelope.
    #[must_use]
    pub fn failure(error: CallFailure, latency_ms: u64) -> Self {
        Self {
            ok: false,
            output: None,
            error: Some(error),
            latency_ms,
            tokens: TokenUsage::default(),
        }
    }

    /// Returns the failure, treating a malformed envelope (`ok == false`
    /// with no error set) as transient.
    #[must_use]
    pub fn failure_or_default(&self) -> CallFailure {
        self.error
            .clone()
            .unwrap_or_else(|| CallFailure::transient("provider returned no error detail"))
    }
}

/// Uniform call contract wrapping one external generative service.
///
/// Implementations enforce their own per-call timeout (from
/// [`CallOptions::timeout_ms`]), check the cancellation token
/// cooperatively, and normalize provider-specific response shapes into the
/// envelope. They must never panic or return early through an error path.
#[async_trait]
pub trait ProviderAdapter: Send + Sync + Debug {
    /// The identity of the wrapped provider.
    fn id(&self) -> ProviderId;

    /// Executes one call, returning the normalized envelope.
    async fn call(&self, call: &ProviderCall, cancel: &Arc<CancellationToken>) -> ProviderEnvelope;
}
