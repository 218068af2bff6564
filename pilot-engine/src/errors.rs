//! Error types for the orchestration engine.
//!
//! Two distinct layers live here. [`FailureKind`] classifies provider and
//! routing failures that travel as *data* inside envelopes and job rows.
//! [`EngineError`] is the crate's `Result` error for operations that can
//! genuinely fail at the call site (store access, pipeline validation).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a provider or routing failure.
///
/// Adapters and the router never raise these; they are carried inside
/// [`crate::provider::ProviderEnvelope`] and persisted with job rows as
/// stable string codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, remote 5xx, or network failure. Eligible for chain
    /// fallback and job-level retry.
    Transient,
    /// Malformed or unparseable provider output. Fails the stage without
    /// trying the rest of the chain.
    Permanent,
    /// The provider's breaker was open; no network attempt was made.
    CircuitOpen,
    /// The routing or pipeline budget elapsed before any success.
    BudgetExhausted,
}

impl FailureKind {
    /// Returns the stable string code used in persisted rows.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::BudgetExhausted => "budget_exhausted",
        }
    }

    /// Parses a stable string code back into a kind.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            "circuit_open" => Some(Self::CircuitOpen),
            "budget_exhausted" => Some(Self::BudgetExhausted),
            _ => None,
        }
    }

    /// Returns true if the failure may be retried by the fallback chain
    /// within a single routing attempt.
    ///
    /// Circuit-open failures are chain-retryable but do not count against
    /// the provider's own failure counter (nothing was attempted).
    #[must_use]
    pub const fn chain_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::CircuitOpen)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure envelope carried through routing and stage results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    /// The failure classification.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl CallFailure {
    /// Creates a new failure.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    /// Creates a circuit-open failure.
    #[must_use]
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CircuitOpen, message)
    }

    /// Creates a budget-exhausted failure.
    #[must_use]
    pub fn budget_exhausted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::BudgetExhausted, message)
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A waterfall specification failed validation.
    #[error("{0}")]
    Validation(#[from] WaterfallValidationError),

    /// The job store rejected or failed an operation.
    #[error("Job store error: {0}")]
    Store(String),

    /// The referenced job does not exist.
    #[error("Unknown job: {0}")]
    UnknownJob(uuid::Uuid),

    /// No pipeline is registered for the requested kind.
    #[error("Unknown pipeline kind: {0}")]
    UnknownKind(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Error raised when a waterfall specification fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WaterfallValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl WaterfallValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when a dependency cycle is detected in a waterfall.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in waterfall: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for WaterfallValidationError {
    fn from(err: CycleDetectedError) -> Self {
        WaterfallValidationError {
            message: err.to_string(),
            stages: err.cycle_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_codes_round_trip() {
        for kind in [
            FailureKind::Transient,
            FailureKind::Permanent,
            FailureKind::CircuitOpen,
            FailureKind::BudgetExhausted,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FailureKind::from_code("nonsense"), None);
    }

    #[test]
    fn test_chain_retryable() {
        assert!(FailureKind::Transient.chain_retryable());
        assert!(FailureKind::CircuitOpen.chain_retryable());
        assert!(!FailureKind::Permanent.chain_retryable());
        assert!(!FailureKind::BudgetExhausted.chain_retryable());
    }

    #[test]
    fn test_call_failure_display() {
        let failure = CallFailure::transient("connection reset");
        assert_eq!(failure.to_string(), "transient: connection reset");
    }

    #[test]
    fn test_cycle_error_message() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let validation: WaterfallValidationError = err.into();
        assert_eq!(validation.stages, vec!["a", "b", "a"]);
    }
}
