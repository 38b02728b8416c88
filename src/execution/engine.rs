//! Main execution engine - drives a pipeline run from facts to report

use crate::{
    core::{
        context::fact_env,
        facts::parse_declarations,
        FactLedger, Phase, Pipeline, PipelineStatus, PublishSpec, RunState, Step, StepAction,
        StepContext, StepOutcome, StepRecord, StepResult,
    },
    execution::{
        background::{BackgroundReport, BackgroundSupervisor},
        host::CommandHost,
        publish::ArtifactPublisher,
        report::RunReport,
        retry::with_retry,
        runner::CommandRunner,
    },
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Skip reason for steps never reached before the deadline
pub const DEADLINE_SKIP_REASON: &str = "run deadline exceeded";

/// Events that can occur during a run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        total_steps: usize,
    },
    BackgroundStarted {
        name: String,
        sink: PathBuf,
    },
    StepSkipped {
        step_id: String,
        phase: Phase,
        reason: String,
    },
    StepStarted {
        step_id: String,
        display_name: String,
        phase: Phase,
        index: usize,
    },
    StepRetrying {
        step_id: String,
        attempt: usize,
        max_attempts: usize,
    },
    StepFinished {
        step_id: String,
        result: StepResult,
        tolerated: bool,
    },
    FactDeclared {
        step_id: String,
        name: String,
        value: String,
    },
    BackgroundDrained {
        report: BackgroundReport,
    },
    DeadlineExceeded {
        deadline: Duration,
    },
    RunFinished {
        run_id: Uuid,
        state: RunState,
        exit_code: i32,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Mutable state threaded through one run
struct RunProgress {
    ledger: FactLedger,
    status: PipelineStatus,
    records: Vec<StepRecord>,
    deadline_reported: bool,
}

/// Pipeline execution engine
///
/// Steps run strictly one at a time in declaration order. The only other
/// activity is the optional background task, which is drained between the
/// main and deploy phases.
pub struct ExecutionEngine<H, P> {
    runner: CommandRunner<H>,
    publisher: P,
    supervisor: BackgroundSupervisor,
    workspace: PathBuf,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl<H: CommandHost, P: ArtifactPublisher> ExecutionEngine<H, P> {
    pub fn new(host: H, publisher: P) -> Self {
        let workspace = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            runner: CommandRunner::new(host),
            publisher,
            supervisor: BackgroundSupervisor::new(workspace.clone()),
            workspace,
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Directory steps run in unless they set their own
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self.supervisor = BackgroundSupervisor::new(self.workspace.clone());
        self
    }

    /// Replace the background supervisor
    pub fn with_supervisor(mut self, supervisor: BackgroundSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn host(&self) -> &H {
        self.runner.host()
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: ExecutionEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Execute the whole pipeline. Never fails: problems end up in the report.
    pub async fn execute(&self, pipeline: &Pipeline) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        info!("Starting run {} of pipeline {}", run_id, pipeline.name);
        self.emit_event(ExecutionEvent::RunStarted {
            run_id,
            pipeline_name: pipeline.name.clone(),
            total_steps: pipeline.total_steps(),
        })
        .await;

        let snapshot = pipeline.facts.snapshot();
        debug!("Captured {} facts", snapshot.len());
        let mut progress = RunProgress {
            ledger: FactLedger::new(snapshot),
            status: PipelineStatus::default(),
            records: Vec::with_capacity(pipeline.total_steps()),
            deadline_reported: false,
        };

        let cancel = CancellationToken::new();
        let watchdog = pipeline.deadline.map(|deadline| {
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                token.cancel();
            })
        });

        let mut background = None;
        let mut background_report = None;
        if let Some(spec) = &pipeline.background {
            let env = fact_env(&progress.ledger.view(0));
            match self.supervisor.start(spec, &env) {
                Ok(handle) => {
                    self.emit_event(ExecutionEvent::BackgroundStarted {
                        name: spec.name.clone(),
                        sink: handle.sink().to_path_buf(),
                    })
                    .await;
                    background = Some(handle);
                }
                Err(e) => {
                    warn!("Background task {} did not start: {}", spec.name, e);
                    background_report = Some(BackgroundReport::not_started(&spec.name, &e));
                }
            }
        }

        for (index, step) in pipeline.steps.iter().enumerate() {
            self.run_step(pipeline, step, index, &mut progress, &cancel).await;
        }

        // Teardown runs regardless of how the main phase ended
        if let Some(handle) = background {
            background_report = Some(self.supervisor.drain(handle, &self.publisher).await);
        }
        if let Some(report) = &background_report {
            self.emit_event(ExecutionEvent::BackgroundDrained {
                report: report.clone(),
            })
            .await;
        }

        let offset = pipeline.deploy_offset();
        for (position, step) in pipeline.deploy.iter().enumerate() {
            self.run_step(pipeline, step, offset + position, &mut progress, &cancel)
                .await;
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let cancelled = progress.records.iter().any(|r| {
            r.outcome == StepOutcome::Cancelled
                || r.skip_reason.as_deref() == Some(DEADLINE_SKIP_REASON)
        });
        let state = if cancelled {
            RunState::Failed
        } else {
            RunState::from(progress.status)
        };

        let report = RunReport {
            run_id,
            pipeline_name: pipeline.name.clone(),
            state,
            cancelled,
            steps: progress.records,
            background: background_report,
            started_at,
            completed_at: Utc::now(),
        };

        info!("Run {} finished: {:?}", run_id, state);
        self.emit_event(ExecutionEvent::RunFinished {
            run_id,
            state,
            exit_code: report.exit_code(),
        })
        .await;

        report
    }

    /// Evaluate and, when its condition holds, run one step
    async fn run_step(
        &self,
        pipeline: &Pipeline,
        step: &Step,
        index: usize,
        progress: &mut RunProgress,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            if !progress.deadline_reported {
                progress.deadline_reported = true;
                error!("Run deadline exceeded, skipping remaining steps");
                self.emit_event(ExecutionEvent::DeadlineExceeded {
                    deadline: pipeline.deadline.unwrap_or_default(),
                })
                .await;
            }
            self.skip(step, DEADLINE_SKIP_REASON.to_string(), progress).await;
            return;
        }

        let view = progress.ledger.view(index);
        if !step.condition.evaluate(&view, progress.status) {
            let reason = if !progress.status.is_succeeded() && !step.condition.may_run_after_failure() {
                "an earlier step failed".to_string()
            } else {
                format!("condition {} is false", step.condition)
            };
            self.skip(step, reason, progress).await;
            return;
        }

        let context = StepContext::for_step(step, index, &view, &self.workspace);

        info!("Running step {} ({})", step.id, step.display_name);
        self.emit_event(ExecutionEvent::StepStarted {
            step_id: step.id.clone(),
            display_name: step.display_name.clone(),
            phase: step.phase,
            index,
        })
        .await;

        let context = &context;
        let result = match &step.retry {
            Some(policy) => {
                let max_attempts = policy.max_attempts;
                with_retry(policy, cancel, move |number| {
                    self.attempt(step, context, number, max_attempts, cancel)
                })
                .await
            }
            None => self.attempt(step, context, 1, 1, cancel).await,
        };

        if result.outcome == StepOutcome::Cancelled && !progress.deadline_reported {
            progress.deadline_reported = true;
            error!("Run deadline exceeded while running step {}", step.id);
            self.emit_event(ExecutionEvent::DeadlineExceeded {
                deadline: pipeline.deadline.unwrap_or_default(),
            })
            .await;
        }

        if result.outcome != StepOutcome::Cancelled {
            for (name, value) in parse_declarations(&result.stdout) {
                match progress.ledger.declare(index, name.clone(), value.clone()) {
                    Ok(()) => {
                        debug!("Step {} declared fact {}", step.id, name);
                        self.emit_event(ExecutionEvent::FactDeclared {
                            step_id: step.id.clone(),
                            name,
                            value,
                        })
                        .await;
                    }
                    Err(e) => warn!("Ignoring fact from step {}: {}", step.id, e),
                }
            }
        }

        progress.status = progress.status.record(result.outcome, step.continue_on_error);
        let tolerated = result.outcome.is_failure() && step.continue_on_error;
        if tolerated {
            warn!("Step {} ended {:?}, continuing on error", step.id, result.outcome);
        } else if result.outcome.is_failure() {
            error!("Step {} ended {:?}", step.id, result.outcome);
        }

        self.emit_event(ExecutionEvent::StepFinished {
            step_id: step.id.clone(),
            result: result.clone(),
            tolerated,
        })
        .await;

        progress.records.push(StepRecord {
            step_id: step.id.clone(),
            display_name: step.display_name.clone(),
            phase: step.phase,
            outcome: result.outcome,
            skip_reason: None,
            tolerated,
            result: Some(result),
            finished_at: Utc::now(),
        });
    }

    async fn skip(&self, step: &Step, reason: String, progress: &mut RunProgress) {
        debug!("Skipping step {}: {}", step.id, reason);
        self.emit_event(ExecutionEvent::StepSkipped {
            step_id: step.id.clone(),
            phase: step.phase,
            reason: reason.clone(),
        })
        .await;
        progress.records.push(StepRecord::skipped(
            &step.id,
            &step.display_name,
            step.phase,
            reason,
        ));
    }

    /// One attempt of a step's action
    async fn attempt(
        &self,
        step: &Step,
        context: &StepContext,
        number: usize,
        max_attempts: usize,
        cancel: &CancellationToken,
    ) -> StepResult {
        if number > 1 {
            self.emit_event(ExecutionEvent::StepRetrying {
                step_id: step.id.clone(),
                attempt: number,
                max_attempts,
            })
            .await;
        }

        match &step.action {
            StepAction::Command(command) => {
                self.runner.run(command, context, step.timeout, cancel).await
            }
            StepAction::Publish(spec) => self.publish(spec, context, step.timeout, cancel).await,
        }
    }

    /// Upload an artifact as a step, mapped onto exit code 0 or 1
    async fn publish(
        &self,
        spec: &PublishSpec,
        context: &StepContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StepResult {
        let local = if spec.path.is_absolute() {
            spec.path.clone()
        } else {
            context.working_dir.join(&spec.path)
        };

        let started = Instant::now();
        let upload = self.publisher.upload(&local, &spec.remote, spec.visibility);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(timeout, upload) => Some(result),
        };
        let elapsed = started.elapsed();

        match outcome {
            None => StepResult::new(StepOutcome::Cancelled, None, elapsed),
            Some(Err(_)) => StepResult::new(StepOutcome::TimedOut, None, elapsed)
                .with_output(String::new(), format!("upload timed out after {:?}", timeout)),
            Some(Ok(Ok(()))) => StepResult::new(StepOutcome::Succeeded, Some(0), elapsed)
                .with_output(
                    format!("published {} to {}\n", local.display(), spec.remote),
                    String::new(),
                ),
            Some(Ok(Err(e))) => StepResult::new(StepOutcome::Failed, Some(1), elapsed)
                .with_output(String::new(), e.to_string()),
        }
    }
}
