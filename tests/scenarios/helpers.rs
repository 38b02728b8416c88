//! Test utilities for scenario tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stepline::core::config::PipelineConfig;
use stepline::core::{Pipeline, RunState, StepOutcome, Visibility};
use stepline::execution::{
    ArtifactPublisher, BackgroundSupervisor, CommandHost, ExecutionEngine, ExecutionEvent,
    HostError, HostOutput, Invocation, PublishError, RunReport,
};
use tokio_util::sync::CancellationToken;

/// Scripted reply for one call of a command
#[derive(Debug, Clone)]
pub struct Reply {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub delay: Duration,
}

impl Reply {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn stdout(mut self, stdout: &str) -> Self {
        self.stdout = stdout.to_string();
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Mock command host that replies from a script keyed by command text
///
/// Commands without a script exit 0. A command scripted with several replies
/// uses them in order and repeats the last one.
#[derive(Default)]
pub struct ScriptedHost {
    script: HashMap<String, Vec<Reply>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, command: &str, reply: Reply) -> Self {
        self.script.entry(command.to_string()).or_default().push(reply);
        self
    }

    /// Every invocation, in call order
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHost for ScriptedHost {
    async fn execute(
        &self,
        invocation: &Invocation,
        stop: &CancellationToken,
    ) -> Result<HostOutput, HostError> {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            let nth = calls.iter().filter(|i| i.command == invocation.command).count();
            calls.push(invocation.clone());
            nth
        };

        let reply = self
            .script
            .get(&invocation.command)
            .and_then(|replies| replies.get(nth).or_else(|| replies.last()))
            .cloned()
            .unwrap_or_else(|| Reply::exit(0));

        // A stopped command reports no exit code, like a killed process
        let exit_code = tokio::select! {
            _ = stop.cancelled() => None,
            _ = tokio::time::sleep(reply.delay) => reply.exit_code,
        };
        Ok(HostOutput {
            exit_code,
            stdout: reply.stdout,
            stderr: String::new(),
            duration: reply.delay,
        })
    }
}

/// One recorded upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub local: PathBuf,
    pub remote: String,
    pub visibility: Visibility,
}

/// Mock publisher that records uploads instead of performing them
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    uploads: Arc<Mutex<Vec<Upload>>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher whose every upload fails after being recorded
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactPublisher for RecordingPublisher {
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        visibility: Visibility,
    ) -> Result<(), PublishError> {
        self.uploads.lock().unwrap().push(Upload {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            visibility,
        });
        if self.fail {
            return Err(PublishError::InvalidRemote(remote.to_string()));
        }
        Ok(())
    }
}

/// Result of a scenario run
pub struct ScenarioResult {
    pub report: RunReport,
    pub events: Vec<ExecutionEvent>,
    pub commands: Vec<String>,
    pub uploads: Vec<Upload>,

    /// Every host invocation, in call order
    pub calls: Vec<Invocation>,
}

impl ScenarioResult {
    pub fn outcome(&self, step_id: &str) -> StepOutcome {
        self.report
            .outcome(step_id)
            .unwrap_or_else(|| panic!("Step '{}' not found in report", step_id))
    }

    /// How often `command` reached the host
    pub fn call_count(&self, command: &str) -> usize {
        self.commands.iter().filter(|c| *c == command).count()
    }

    pub fn count_events<F: Fn(&ExecutionEvent) -> bool>(&self, matches: F) -> usize {
        self.events.iter().filter(|e| matches(e)).count()
    }

    pub fn summary(&self) -> String {
        self.report
            .steps
            .iter()
            .map(|r| format!("{}={:?}", r.step_id, r.outcome))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Build a pipeline from YAML with fixed facts instead of the real environment
pub fn pipeline_from_yaml(yaml: &str, facts: &[(&str, &str)]) -> Pipeline {
    let config = PipelineConfig::from_yaml(yaml).expect("Failed to parse YAML");
    let mut pipeline = config.to_pipeline();
    // Pin the known keys so the ambient environment cannot leak in
    for key in ["DEPLOY", "DEPLOY_ALT", "IMAGE", "SCRIPT"] {
        pipeline.facts.overrides.push((key.to_string(), String::new()));
    }
    for (key, value) in facts {
        pipeline.facts.overrides.push((key.to_string(), value.to_string()));
    }
    pipeline
}

/// Run a pipeline against a scripted host and a recording publisher
pub async fn run_scenario(pipeline: &Pipeline, host: ScriptedHost) -> ScenarioResult {
    run_scenario_with(pipeline, host, RecordingPublisher::new(), None).await
}

pub async fn run_scenario_with(
    pipeline: &Pipeline,
    host: ScriptedHost,
    publisher: RecordingPublisher,
    workspace: Option<&Path>,
) -> ScenarioResult {
    let workspace = workspace
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    let engine = ExecutionEngine::new(host, publisher.clone())
        .with_workspace(&workspace)
        .with_supervisor(
            BackgroundSupervisor::new(&workspace).with_grace(Duration::from_millis(50)),
        );

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine
        .add_event_handler(move |event| sink.lock().unwrap().push(event))
        .await;

    let report = engine.execute(pipeline).await;

    let calls = engine.host().calls();
    let events = events.lock().unwrap().clone();

    ScenarioResult {
        report,
        events,
        commands: calls.iter().map(|i| i.command.clone()).collect(),
        uploads: publisher.uploads(),
        calls,
    }
}

/// Assert a step ended with the expected outcome
pub fn assert_outcome(result: &ScenarioResult, step_id: &str, expected: StepOutcome) {
    assert_eq!(
        result.outcome(step_id),
        expected,
        "Step '{}' outcome mismatch ({})",
        step_id,
        result.summary()
    );
}

pub fn assert_run_succeeded(result: &ScenarioResult) {
    assert_eq!(
        result.report.state,
        RunState::Succeeded,
        "Run should succeed ({})",
        result.summary()
    );
    assert_eq!(result.report.exit_code(), 0);
}

pub fn assert_run_failed(result: &ScenarioResult) {
    assert_eq!(
        result.report.state,
        RunState::Failed,
        "Run should fail ({})",
        result.summary()
    );
    assert_ne!(result.report.exit_code(), 0);
}

/// Assert which commands reached the host, in order
pub fn assert_commands(result: &ScenarioResult, expected: &[&str]) {
    assert_eq!(result.commands, expected, "({})", result.summary());
}
