//! Waterfall specifications and their validation.

use super::{OutputCheck, PromptBuilder};
use crate::errors::{CycleDetectedError, WaterfallValidationError};
use crate::provider::{CallOptions, ProviderId, Role};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One stage in a waterfall.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage name, unique within the waterfall.
    pub name: String,
    /// The role the stage runs as.
    pub role: Role,
    /// Ordered provider fallback chain for the stage.
    pub chain: Vec<ProviderId>,
    /// Upstream stages whose outputs this stage consumes.
    pub dependencies: Vec<String>,
    /// The subset of dependencies without which the stage cannot run.
    pub hard_dependencies: Vec<String>,
    /// Prompt assembly for the stage.
    pub prompt: Arc<dyn PromptBuilder>,
    /// Optional structural check on a successful output.
    pub check: Option<Arc<dyn OutputCheck>>,
    /// Generation parameters.
    pub options: CallOptions,
    /// Per-stage override of the hedging timeout.
    pub primary_timeout_ms: Option<u64>,
    /// Per-stage override of the routing budget.
    pub total_budget_ms: Option<u64>,
}

impl StageSpec {
    /// Creates a stage with no dependencies and default options.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        role: Role,
        chain: Vec<ProviderId>,
        prompt: Arc<dyn PromptBuilder>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            chain,
            dependencies: Vec::new(),
            hard_dependencies: Vec::new(),
            prompt,
            check: None,
            options: CallOptions::default(),
            primary_timeout_ms: None,
            total_budget_ms: None,
        }
    }

    /// Declares soft dependencies: the stage runs even if they failed,
    /// with the absent inputs marked.
    #[must_use]
    pub fn with_dependencies(mut self, deps: Vec<&str>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Declares hard dependencies; each must also appear in
    /// `dependencies`.
    #[must_use]
    pub fn with_hard_dependencies(mut self, deps: Vec<&str>) -> Self {
        self.hard_dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Attaches a structural check to the stage's output.
    #[must_use]
    pub fn with_check(mut self, check: Arc<dyn OutputCheck>) -> Self {
        self.check = Some(check);
        self
    }

    /// Sets the generation parameters.
    #[must_use]
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the hedging timeout for this stage.
    #[must_use]
    pub const fn with_primary_timeout_ms(mut self, ms: u64) -> Self {
        self.primary_timeout_ms = Some(ms);
        self
    }

    /// Overrides the routing budget for this stage.
    #[must_use]
    pub const fn with_total_budget_ms(mut self, ms: u64) -> Self {
        self.total_budget_ms = Some(ms);
        self
    }
}

/// A validated waterfall: a DAG of stages under one pipeline kind.
#[derive(Debug, Clone)]
pub struct WaterfallSpec {
    kind: String,
    stages: Vec<StageSpec>,
    index: HashMap<String, usize>,
}

impl WaterfallSpec {
    /// Starts building a waterfall for a pipeline kind.
    #[must_use]
    pub fn builder(kind: impl Into<String>) -> WaterfallSpecBuilder {
        WaterfallSpecBuilder {
            kind: kind.into(),
            stages: Vec::new(),
        }
    }

    /// The pipeline kind this waterfall implements.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Looks up a stage's index by name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Indices of stages that directly depend on `name`.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| stage.dependencies.iter().any(|d| d == name))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of sink stages: those no other stage depends on. A job is
    /// ok exactly when every sink stage produced an output.
    #[must_use]
    pub fn sinks(&self) -> Vec<usize> {
        let consumed: HashSet<&str> = self
            .stages
            .iter()
            .flat_map(|stage| stage.dependencies.iter().map(String::as_str))
            .collect();
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| !consumed.contains(stage.name.as_str()))
            .map(|(i, _)| i)
            .collect()
    }

    /// In-degree per stage, indexed like [`Self::stages`].
    #[must_use]
    pub fn in_degrees(&self) -> Vec<usize> {
        self.stages
            .iter()
            .map(|stage| stage.dependencies.len())
            .collect()
    }
}

/// Builder that validates the DAG on [`build`](Self::build).
pub struct WaterfallSpecBuilder {
    kind: String,
    stages: Vec<StageSpec>,
}

impl WaterfallSpecBuilder {
    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates and finalizes the waterfall.
    pub fn build(self) -> Result<WaterfallSpec, WaterfallValidationError> {
        if self.stages.is_empty() {
            return Err(WaterfallValidationError::new(
                "a waterfall needs at least one stage",
            ));
        }

        let mut index = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(WaterfallValidationError::new(format!(
                    "duplicate stage name '{}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()]));
            }
            if stage.chain.is_empty() {
                return Err(WaterfallValidationError::new(format!(
                    "stage '{}' has an empty provider chain",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()]));
            }
        }

        for stage in &self.stages {
            for dep in &stage.dependencies {
                if dep == &stage.name {
                    return Err(WaterfallValidationError::new(format!(
                        "stage '{}' depends on itself",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone()]));
                }
                if !index.contains_key(dep) {
                    return Err(WaterfallValidationError::new(format!(
                        "stage '{}' depends on unknown stage '{dep}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), dep.clone()]));
                }
            }
            for hard in &stage.hard_dependencies {
                if !stage.dependencies.contains(hard) {
                    return Err(WaterfallValidationError::new(format!(
                        "hard dependency '{hard}' of stage '{}' is not a declared dependency",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), hard.clone()]));
                }
            }
        }

        detect_cycle(&self.stages, &index)?;

        Ok(WaterfallSpec {
            kind: self.kind,
            stages: self.stages,
            index,
        })
    }
}

/// Depth-first cycle detection reporting the offending path.
fn detect_cycle(
    stages: &[StageSpec],
    index: &HashMap<String, usize>,
) -> Result<(), CycleDetectedError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: usize,
        stages: &[StageSpec],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
        path: &mut Vec<String>,
    ) -> Result<(), CycleDetectedError> {
        marks[node] = Mark::Grey;
        path.push(stages[node].name.clone());

        for dep in &stages[node].dependencies {
            let Some(&next) = index.get(dep) else {
                continue;
            };
            match marks[next] {
                Mark::Grey => {
                    let mut cycle = path.clone();
                    cycle.push(dep.clone());
                    return Err(CycleDetectedError::new(cycle));
                }
                Mark::White => visit(next, stages, index, marks, path)?,
                Mark::Black => {}
            }
        }

        path.pop();
        marks[node] = Mark::Black;
        Ok(())
    }

    let mut marks = vec![Mark::White; stages.len()];
    let mut path = Vec::new();
    for node in 0..stages.len() {
        if marks[node] == Mark::White {
            visit(node, stages, index, &mut marks, &mut path)?;
        }
    }
    Ok(())
}
