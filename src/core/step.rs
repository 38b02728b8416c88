//! Step domain model

use crate::core::{
    condition::Condition,
    config::{BackoffConfig, PublishConfig, RetryConfig, StepConfig},
    state::Phase,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A single step in a pipeline
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Name shown in reports
    pub display_name: String,

    /// What the step does when it runs
    pub action: StepAction,

    /// Gate evaluated right before the step
    pub condition: Condition,

    /// A failure of this step leaves the pipeline status unchanged
    pub continue_on_error: bool,

    /// Per-attempt timeout
    pub timeout: Duration,

    /// Variables merged over the facts for this step only
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the run's workspace
    pub working_dir: Option<PathBuf>,

    /// Retry policy for network-sensitive steps
    pub retry: Option<RetryPolicy>,

    pub phase: Phase,
}

/// The work a step performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Command text handed to the shell as a single unit
    Command(String),
    /// Artifact upload through the publisher
    Publish(PublishSpec),
}

/// Artifact to upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSpec {
    pub path: PathBuf,
    pub remote: String,
    pub visibility: Visibility,
}

/// Who can see an uploaded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

/// Bounded retries with backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential {
        initial: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { initial, factor, max } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let millis = initial.as_millis() as f64 * factor.powi(exponent);
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis.max(0.0).round() as u64)
                }
            }
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let backoff = match &config.backoff {
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(*delay_ms)),
            BackoffConfig::Exponential {
                initial_ms,
                factor,
                max_ms,
            } => Backoff::Exponential {
                initial: Duration::from_millis(*initial_ms),
                factor: *factor,
                max: Duration::from_millis(*max_ms),
            },
        };
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Values a step falls back to when its config is silent
#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            retry: RetryPolicy::default(),
        }
    }
}

impl Step {
    /// Create a step from a step config. The config must already be validated.
    pub fn from_config(config: &StepConfig, phase: Phase, defaults: &StepDefaults) -> Self {
        let action = match (&config.run, &config.publish) {
            (_, Some(publish)) => StepAction::Publish(PublishSpec::from_config(publish)),
            (Some(run), None) => StepAction::Command(run.clone()),
            (None, None) => StepAction::Command(String::new()),
        };

        let condition = config.condition.clone().unwrap_or_default();

        let retry = config.retry.as_ref().and_then(|r| r.resolve(&defaults.retry));

        Step {
            id: config.id.clone(),
            display_name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            action,
            condition,
            continue_on_error: config.continue_on_error,
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            env: config.env.clone(),
            working_dir: config.working_dir.clone(),
            retry,
            phase,
        }
    }

    /// Create a command step with default policy, runs while the pipeline succeeds
    pub fn command(id: &str, command: &str) -> Self {
        Step {
            id: id.to_string(),
            display_name: id.to_string(),
            action: StepAction::Command(command.to_string()),
            condition: Condition::Succeeded,
            continue_on_error: false,
            timeout: StepDefaults::default().timeout,
            env: BTreeMap::new(),
            working_dir: None,
            retry: None,
            phase: Phase::Main,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

impl PublishSpec {
    fn from_config(config: &PublishConfig) -> Self {
        Self {
            path: config.path.clone(),
            remote: config.to.clone(),
            visibility: config.visibility,
        }
    }
}
