//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Aggregate success/failure of a run so far
///
/// Starts `Succeeded`. Once a step without `continue_on_error` fails the
/// status becomes `Failed` and stays there for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PipelineStatus {
    #[default]
    Succeeded,
    Failed,
}

impl PipelineStatus {
    /// Fold a step outcome into the status. Failure is sticky.
    pub fn record(self, outcome: StepOutcome, continue_on_error: bool) -> Self {
        match self {
            PipelineStatus::Failed => PipelineStatus::Failed,
            PipelineStatus::Succeeded => {
                if outcome.is_failure() && !continue_on_error {
                    PipelineStatus::Failed
                } else {
                    PipelineStatus::Succeeded
                }
            }
        }
    }

    pub fn is_succeeded(self) -> bool {
        self == PipelineStatus::Succeeded
    }
}

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Run has not started
    NotStarted,
    /// Steps are being evaluated
    Running,
    /// All steps evaluated and the status never flipped
    Succeeded,
    /// Status was Failed at the end of the run
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl From<PipelineStatus> for RunState {
    fn from(status: PipelineStatus) -> Self {
        match status {
            PipelineStatus::Succeeded => RunState::Succeeded,
            PipelineStatus::Failed => RunState::Failed,
        }
    }
}

/// Outcome of one step as shown in the final report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
    /// Aborted by the run-level deadline
    Cancelled,
    Skipped,
}

impl StepOutcome {
    /// Outcomes that count as an error for status purposes
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            StepOutcome::Failed | StepOutcome::TimedOut | StepOutcome::Cancelled
        )
    }

    /// Outcomes worth another attempt under a retry policy
    pub fn is_retryable(self) -> bool {
        matches!(self, StepOutcome::Failed | StepOutcome::TimedOut)
    }
}

/// Result of running a step's action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub outcome: StepOutcome,

    /// Exit code of the last attempt (None when killed or never spawned)
    pub exit_code: Option<i32>,

    /// Wall time of the last attempt
    #[serde(with = "duration_ms")]
    pub duration: Duration,

    pub stdout: String,
    pub stderr: String,

    /// Number of runner calls made for this step
    pub attempts: usize,
}

impl StepResult {
    pub fn new(outcome: StepOutcome, exit_code: Option<i32>, duration: Duration) -> Self {
        Self {
            outcome,
            exit_code,
            duration,
            stdout: String::new(),
            stderr: String::new(),
            attempts: 1,
        }
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Retries performed on top of the first attempt
    pub fn retried(&self) -> usize {
        self.attempts.saturating_sub(1)
    }
}

/// Which part of the run a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Main,
    Deploy,
}

/// Entry in the ordered run log. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub display_name: String,
    pub phase: Phase,
    pub outcome: StepOutcome,

    /// Why the step did not run
    pub skip_reason: Option<String>,

    /// The step failed but `continue_on_error` kept the status unchanged
    pub tolerated: bool,

    pub result: Option<StepResult>,
    pub finished_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn skipped(step_id: &str, display_name: &str, phase: Phase, reason: impl Into<String>) -> Self {
        Self {
            step_id: step_id.to_string(),
            display_name: display_name.to_string(),
            phase,
            outcome: StepOutcome::Skipped,
            skip_reason: Some(reason.into()),
            tolerated: false,
            result: None,
            finished_at: Utc::now(),
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
