//! Step context - the environment a single step runs with

use crate::core::{facts::FactView, step::Step};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Variable naming the step that is running
pub const STEP_ID_VAR: &str = "STEPLINE_STEP_ID";

/// Execution context for one step
///
/// Built from the facts visible to the step, overlaid with the step's own
/// `env` overrides. The overrides never leak to other steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    /// The step being executed
    pub step_id: String,

    /// Global position of the step in the run
    pub step_index: usize,

    /// Environment handed to the subprocess
    pub env: BTreeMap<String, String>,

    /// Directory the command runs in
    pub working_dir: PathBuf,
}

impl StepContext {
    /// Build the context for `step` at `step_index`
    pub fn for_step(step: &Step, step_index: usize, facts: &FactView<'_>, workspace: &Path) -> Self {
        let mut env = fact_env(facts);
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.insert(STEP_ID_VAR.to_string(), step.id.clone());

        let working_dir = match &step.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.to_path_buf(),
        };

        Self {
            step_id: step.id.clone(),
            step_index,
            env,
            working_dir,
        }
    }

    /// Get a variable
    pub fn get_variable(&self, key: &str) -> Option<&String> {
        self.env.get(key)
    }
}

/// Facts that are exported to subprocesses.
///
/// Dotted facts (e.g. `secrets.*`) are for conditions only.
pub fn fact_env(facts: &FactView<'_>) -> BTreeMap<String, String> {
    facts
        .to_map()
        .into_iter()
        .filter(|(key, _)| !key.contains('.'))
        .collect()
}
