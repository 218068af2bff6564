//! Waterfall pipeline definitions and execution.
//!
//! A pipeline is a validated DAG of stages. Each stage names a role, a
//! provider fallback chain, and the stages it consumes. Execution fans
//! out independent stages, fans in at join points, and appends one
//! [`crate::jobs::StageRecord`] per stage as it completes.

mod spec;
mod waterfall;

#[cfg(test)]
mod integration_tests;

pub use spec::{StageSpec, WaterfallSpec, WaterfallSpecBuilder};
pub use waterfall::{StageResult, WaterfallOutcome, WaterfallRunner};

use serde_json::Value;
use std::collections::HashMap;

/// The inputs visible to one stage: one slot per declared dependency.
///
/// A slot holds `Some(output)` when the upstream stage succeeded and
/// `None` when it failed or was skipped. Soft dependencies run with
/// absent inputs marked; hard dependencies never reach the prompt builder
/// with an absent slot.
#[derive(Debug, Clone, Default)]
pub struct StageInputs {
    slots: HashMap<String, Option<Value>>,
}

impl StageInputs {
    /// Creates an empty input set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills one slot.
    pub fn insert(&mut self, name: impl Into<String>, output: Option<Value>) {
        self.slots.insert(name.into(), output);
    }

    /// Returns the output of an upstream stage, if it produced one.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).and_then(Option::as_ref)
    }

    /// Whether the named upstream stage produced an output.
    #[must_use]
    pub fn is_present(&self, name: &str) -> bool {
        matches!(self.slots.get(name), Some(Some(_)))
    }

    /// Iterates over slots that hold an output.
    pub fn present(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.as_ref().map(|value| (name.as_str(), value)))
    }

    /// Names of slots that are absent.
    #[must_use]
    pub fn absent(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// The prompt produced for one stage call.
#[derive(Debug, Clone)]
pub struct PromptParts {
    /// System prompt for the stage's role.
    pub system: String,
    /// Payload handed to the provider adapter.
    pub payload: Value,
}

/// Builds the prompt for a stage from the trigger and upstream outputs.
pub trait PromptBuilder: Send + Sync + std::fmt::Debug {
    /// Assembles the prompt. `trigger` is the job's original payload;
    /// `inputs` holds one slot per declared dependency.
    fn build(&self, key: &str, trigger: &Value, inputs: &StageInputs) -> PromptParts;
}

/// Structural check applied to a stage's successful output.
///
/// A failed check downgrades the stage to a permanent failure: the
/// provider answered, but with something the pipeline cannot use, and
/// re-asking another provider the same question is the router's job,
/// not the stage's.
pub trait OutputCheck: Send + Sync + std::fmt::Debug {
    /// Returns the violation when the output is unusable.
    fn check(&self, output: &Value) -> Result<(), String>;
}

/// Checks that the output is a JSON object containing every named key.
#[derive(Debug, Clone)]
pub struct RequiredKeysCheck {
    keys: Vec<String>,
}

impl RequiredKeysCheck {
    /// Creates a check for the given keys.
    #[must_use]
    pub fn new(keys: Vec<&str>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl OutputCheck for RequiredKeysCheck {
    fn check(&self, output: &Value) -> Result<(), String> {
        let Some(object) = output.as_object() else {
            return Err("output is not a JSON object".to_string());
        };
        for key in &self.keys {
            if !object.contains_key(key) {
                return Err(format!("output is missing required key '{key}'"));
            }
        }
        Ok(())
    }
}

/// Default prompt builder: a fixed system prompt plus a JSON payload
/// bundling the key, the trigger, and every present upstream output.
///
/// Absent soft inputs are listed by name so the model knows what is
/// missing rather than silently seeing less context.
#[derive(Debug, Clone)]
pub struct JsonPromptBuilder {
    system: String,
}

impl JsonPromptBuilder {
    /// Creates a builder with the given system prompt.
    #[must_use]
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }
}

impl PromptBuilder for JsonPromptBuilder {
    fn build(&self, key: &str, trigger: &Value, inputs: &StageInputs) -> PromptParts {
        let mut upstream = serde_json::Map::new();
        for (name, value) in inputs.present() {
            upstream.insert(name.to_string(), value.clone());
        }
        let missing: Vec<&str> = inputs.absent();

        PromptParts {
            system: self.system.clone(),
            payload: serde_json::json!({
                "key": key,
                "trigger": trigger,
                "inputs": Value::Object(upstream),
                "missing_inputs": missing,
            }),
        }
    }
}
