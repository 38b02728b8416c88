//! Pipeline configuration from YAML

use crate::core::{condition::Condition, step::Visibility, Pipeline};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    pub name: String,

    /// Pipeline version (optional)
    #[serde(default)]
    pub version: Option<String>,

    /// Job name exposed as the `JOB` fact
    #[serde(default)]
    pub job: Option<String>,

    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Deadline for the whole run (in seconds)
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    /// Static facts merged over the environment snapshot
    #[serde(default)]
    facts: HashMap<String, Value>,

    /// Environment variables captured as facts
    #[serde(default)]
    pub fact_keys: Vec<String>,

    /// Secrets whose presence is exposed as `secrets.NAME`
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Default policy for steps with `retry: true`
    #[serde(default)]
    pub retry: Option<RetryConfig>,

    /// Process that runs alongside the whole step sequence
    #[serde(default)]
    pub background: Option<BackgroundConfig>,

    /// Pipeline steps
    #[serde(default)]
    pub steps: Vec<StepConfig>,

    /// Steps run after the main sequence, typically artifact uploads
    #[serde(default)]
    pub deploy: Vec<StepConfig>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name
    #[serde(default)]
    pub name: Option<String>,

    /// Command text, run by the shell as one unit
    #[serde(default)]
    pub run: Option<String>,

    /// Artifact upload instead of a command
    #[serde(default)]
    pub publish: Option<PublishConfig>,

    /// Condition, parsed from its expression text. Defaults to `succeeded()`.
    #[serde(default)]
    pub condition: Option<Condition>,

    /// Failure of this step does not fail the pipeline
    #[serde(default)]
    pub continue_on_error: bool,

    /// Timeout for this step (overrides global)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Environment overrides for this step only
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the command
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// `true` for the pipeline default policy, or an explicit policy
    #[serde(default)]
    pub retry: Option<RetrySetting>,
}

/// Artifact upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Local file to upload
    pub path: PathBuf,

    /// Remote location
    pub to: String,

    #[serde(default)]
    pub visibility: Visibility,
}

/// Background task configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_background_name")]
    pub name: String,

    /// Command text for the long-running process
    pub command: String,

    /// File the process writes its output to
    pub sink: PathBuf,

    /// Remote location for the best-effort upload at teardown
    #[serde(default)]
    pub upload_to: Option<String>,

    #[serde(default)]
    pub visibility: Visibility,
}

fn default_background_name() -> String {
    "background".to_string()
}

/// Retry setting on a step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetrySetting {
    Enabled(bool),
    Policy(RetryConfig),
}

impl RetrySetting {
    /// Resolve to a concrete policy, `None` when retries are off
    pub fn resolve(&self, default: &crate::core::step::RetryPolicy) -> Option<crate::core::step::RetryPolicy> {
        match self {
            RetrySetting::Enabled(true) => Some(default.clone()),
            RetrySetting::Enabled(false) => None,
            RetrySetting::Policy(config) => Some(crate::core::step::RetryPolicy::from_config(config)),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}

/// Delay between retry attempts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackoffConfig {
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        #[serde(default = "default_backoff_factor")]
        factor: f64,
        max_ms: u64,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig::Exponential {
            initial_ms: 1000,
            factor: default_backoff_factor(),
            max_ms: 30_000,
        }
    }
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// All steps, main phase first
    pub fn all_steps(&self) -> impl Iterator<Item = &StepConfig> {
        self.steps.iter().chain(self.deploy.iter())
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        // Step IDs are unique across both phases
        let mut seen_ids = HashSet::new();
        for step in self.all_steps() {
            if !seen_ids.insert(&step.id) {
                anyhow::bail!("Duplicate step ID: {}", step.id);
            }
        }

        for step in self.all_steps() {
            match (&step.run, &step.publish) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("Step '{}' has both 'run' and 'publish'", step.id)
                }
                (None, None) => {
                    anyhow::bail!("Step '{}' needs either 'run' or 'publish'", step.id)
                }
                _ => {}
            }

            if step.timeout_secs == Some(0) {
                anyhow::bail!("Step '{}' timeout_secs must be positive", step.id);
            }

            if let Some(RetrySetting::Policy(policy)) = &step.retry {
                if policy.max_attempts == 0 {
                    anyhow::bail!("Step '{}' retry max_attempts must be at least 1", step.id);
                }
            }
        }

        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                anyhow::bail!("Pipeline retry max_attempts must be at least 1");
            }
        }

        if self.default_timeout_secs == Some(0) {
            anyhow::bail!("default_timeout_secs must be positive");
        }

        if self.deadline_secs == Some(0) {
            anyhow::bail!("deadline_secs must be positive");
        }

        if let Some(background) = &self.background {
            if background.command.trim().is_empty() {
                anyhow::bail!("Background task '{}' has an empty command", background.name);
            }
            if background.sink.as_os_str().is_empty() {
                anyhow::bail!("Background task '{}' has an empty sink path", background.name);
            }
        }

        Ok(())
    }

    /// Static facts as strings. Scalars are stringified, so `DEPLOY: 1` becomes "1".
    pub fn facts_as_string_map(&self) -> HashMap<String, String> {
        self.facts
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    other => serde_yaml::to_string(other)
                        .unwrap_or_default()
                        .trim_end()
                        .to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::from_config(self)
    }
}
