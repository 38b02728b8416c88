//! Final run report

use crate::{
    core::{RunState, StepOutcome, StepRecord},
    execution::background::BackgroundReport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// Process exit code for a succeeded run
pub const EXIT_SUCCEEDED: i32 = 0;

/// Process exit code for a failed run
pub const EXIT_FAILED: i32 = 1;

/// Process exit code when the run deadline cancelled work
pub const EXIT_DEADLINE: i32 = 124;

/// Everything a run produced, in evaluation order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,

    /// The run deadline fired before every step was evaluated
    pub cancelled: bool,

    /// One record per step, main phase then deploy phase
    pub steps: Vec<StepRecord>,

    pub background: Option<BackgroundReport>,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunReport {
    /// Exit code for the process that ran the pipeline
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            EXIT_DEADLINE
        } else if self.state == RunState::Succeeded {
            EXIT_SUCCEEDED
        } else {
            EXIT_FAILED
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    /// Record for a step by ID
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step_id == id)
    }

    /// Outcome of a step by ID
    pub fn outcome(&self, id: &str) -> Option<StepOutcome> {
        self.step(id).map(|r| r.outcome)
    }

    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn duration_secs(&self) -> i64 {
        (self.completed_at - self.started_at).num_seconds()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as JSON
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .map_err(|e| anyhow::anyhow!("Failed to write report {}: {}", path.display(), e))?;
        Ok(())
    }
}
