//! Pipeline domain model

use crate::core::{
    config::PipelineConfig,
    facts::FactsProvider,
    state::Phase,
    step::{RetryPolicy, Step, StepDefaults, Visibility},
};
use std::path::PathBuf;
use std::time::Duration;

/// A pipeline definition
///
/// Steps run strictly in declaration order: the main phase first, then the
/// deploy phase. A step's global index is its position in that sequence.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Main phase steps
    pub steps: Vec<Step>,

    /// Deploy phase steps, run after the background task is drained
    pub deploy: Vec<Step>,

    /// Long-running process supervised for the whole run
    pub background: Option<BackgroundSpec>,

    /// Deadline for the whole run
    pub deadline: Option<Duration>,

    /// How the facts snapshot is taken
    pub facts: FactsProvider,
}

/// Background task definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundSpec {
    pub name: String,
    pub command: String,

    /// Output file agreed at start time
    pub sink: PathBuf,

    /// Remote location for the teardown upload
    pub upload_to: Option<String>,
    pub visibility: Visibility,
}

impl Pipeline {
    /// Create an empty pipeline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            deploy: Vec::new(),
            background: None,
            deadline: None,
            facts: FactsProvider::default(),
        }
    }

    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        let defaults = StepDefaults {
            timeout: config
                .default_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(StepDefaults::default().timeout),
            retry: config
                .retry
                .as_ref()
                .map(RetryPolicy::from_config)
                .unwrap_or_default(),
        };

        let steps = config
            .steps
            .iter()
            .map(|s| Step::from_config(s, Phase::Main, &defaults))
            .collect();
        let deploy = config
            .deploy
            .iter()
            .map(|s| Step::from_config(s, Phase::Deploy, &defaults))
            .collect();

        let background = config.background.as_ref().map(|b| BackgroundSpec {
            name: b.name.clone(),
            command: b.command.clone(),
            sink: b.sink.clone(),
            upload_to: b.upload_to.clone(),
            visibility: b.visibility,
        });

        let facts = FactsProvider {
            job: config.job.clone(),
            fact_keys: config.fact_keys.clone(),
            secrets: config.secrets.clone(),
            static_facts: config.facts_as_string_map(),
            overrides: Vec::new(),
        };

        Pipeline {
            name: config.name.clone(),
            steps,
            deploy,
            background,
            deadline: config.deadline_secs.map(Duration::from_secs),
            facts,
        }
    }

    /// Append a main phase step
    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step.in_phase(Phase::Main));
        self
    }

    /// Append a deploy phase step
    pub fn with_deploy_step(mut self, step: Step) -> Self {
        self.deploy.push(step.in_phase(Phase::Deploy));
        self
    }

    pub fn with_background(mut self, background: BackgroundSpec) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_facts(mut self, facts: FactsProvider) -> Self {
        self.facts = facts;
        self
    }

    /// Get a step by ID in either phase
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().chain(self.deploy.iter()).find(|s| s.id == id)
    }

    /// Total number of steps across both phases
    pub fn total_steps(&self) -> usize {
        self.steps.len() + self.deploy.len()
    }

    /// Global index of the first deploy step
    pub fn deploy_offset(&self) -> usize {
        self.steps.len()
    }
}
