//! Background task supervision
//!
//! A background task (for example a CPU usage sampler) is started before the
//! first step and runs unattended alongside the whole step sequence. It shares
//! nothing with the steps except its sink file. At teardown the engine drains
//! it exactly once: the process is stopped, the sink is read and optionally
//! uploaded. Nothing that happens here can fail the run.

use crate::{
    core::{BackgroundSpec, Visibility},
    execution::{
        host::{terminate_group, Invocation, ShellHost},
        publish::ArtifactPublisher,
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Variable holding the absolute sink path for the background process
pub const SINK_VAR: &str = "STEPLINE_SINK";

#[derive(Debug, Error)]
pub enum BackgroundError {
    #[error("failed to prepare sink {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn background task: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Handle to a running background task. Consumed by [`BackgroundSupervisor::drain`].
pub struct TaskHandle {
    name: String,
    child: AsyncGroupChild,
    sink: PathBuf,
    upload_to: Option<String>,
    visibility: Visibility,
    started_at: DateTime<Utc>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("sink", &self.sink)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sink(&self) -> &Path {
        &self.sink
    }
}

/// What draining a background task produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundReport {
    pub name: String,

    /// Size of the sink contents, when any were read
    pub bytes: Option<usize>,

    /// Sink contents
    #[serde(skip)]
    pub output: Option<Vec<u8>>,

    pub uploaded: bool,

    /// Exit code if the process ended on its own
    pub exit_code: Option<i32>,

    /// Informational note about anything that went wrong
    pub note: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub drained_at: DateTime<Utc>,
}

impl BackgroundReport {
    /// Report for a task that never started
    pub fn not_started(name: &str, error: &BackgroundError) -> Self {
        Self {
            name: name.to_string(),
            bytes: None,
            output: None,
            uploaded: false,
            exit_code: None,
            note: Some(format!("not started: {}", error)),
            started_at: None,
            drained_at: Utc::now(),
        }
    }

    fn add_note(&mut self, note: String) {
        self.note = Some(match self.note.take() {
            Some(existing) => format!("{}; {}", existing, note),
            None => note,
        });
    }
}

/// Starts and drains background tasks
#[derive(Debug, Clone)]
pub struct BackgroundSupervisor {
    shell: ShellHost,
    workspace: PathBuf,

    /// Time a task gets to finish on its own before being killed
    grace: Duration,
}

impl BackgroundSupervisor {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            shell: ShellHost::default(),
            workspace: workspace.into(),
            grace: Duration::from_millis(500),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_shell(mut self, shell: ShellHost) -> Self {
        self.shell = shell;
        self
    }

    fn sink_path(&self, sink: &Path) -> PathBuf {
        if sink.is_absolute() {
            sink.to_path_buf()
        } else {
            self.workspace.join(sink)
        }
    }

    /// Launch the task without waiting on it. Its stdout goes to the sink.
    pub fn start(
        &self,
        spec: &BackgroundSpec,
        env: &BTreeMap<String, String>,
    ) -> Result<TaskHandle, BackgroundError> {
        let sink = self.sink_path(&spec.sink);
        let sink_err = |source| BackgroundError::Sink {
            path: sink.clone(),
            source,
        };

        if let Some(parent) = sink.parent() {
            std::fs::create_dir_all(parent).map_err(sink_err)?;
        }
        let file = std::fs::File::create(&sink).map_err(sink_err)?;

        let mut env = env.clone();
        env.insert(SINK_VAR.to_string(), sink.display().to_string());
        let invocation = Invocation {
            command: spec.command.clone(),
            env,
            working_dir: self.workspace.clone(),
        };

        // Own process group, so the drain also stops anything the task starts
        let mut child = self
            .shell
            .command(&invocation)
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .group_spawn()
            .map_err(BackgroundError::Spawn)?;

        info!(
            "Started background task {} (pid {:?}) writing to {}",
            spec.name,
            child.inner().id(),
            sink.display()
        );

        Ok(TaskHandle {
            name: spec.name.clone(),
            child,
            sink,
            upload_to: spec.upload_to.clone(),
            visibility: spec.visibility,
            started_at: Utc::now(),
        })
    }

    /// Stop the task, collect its sink and make one upload attempt.
    pub async fn drain<P: ArtifactPublisher + ?Sized>(
        &self,
        mut handle: TaskHandle,
        publisher: &P,
    ) -> BackgroundReport {
        let mut report = BackgroundReport {
            name: handle.name.clone(),
            bytes: None,
            output: None,
            uploaded: false,
            exit_code: None,
            note: None,
            started_at: Some(handle.started_at),
            drained_at: Utc::now(),
        };

        match tokio::time::timeout(self.grace, handle.child.inner().wait()).await {
            Ok(Ok(status)) => {
                report.exit_code = status.code();
                if !status.success() {
                    report.add_note(format!("task exited with {}", status));
                }
            }
            Ok(Err(e)) => report.add_note(format!("failed to wait for task: {}", e)),
            Err(_) => {
                debug!("Stopping background task {}", handle.name);
                terminate_group(&mut handle.child, self.grace).await;
            }
        }

        match tokio::fs::read(&handle.sink).await {
            Ok(bytes) if bytes.is_empty() => report.add_note("task produced no output".to_string()),
            Ok(bytes) => {
                report.bytes = Some(bytes.len());
                report.output = Some(bytes);
            }
            Err(e) => report.add_note(format!("failed to read sink: {}", e)),
        }

        if let (Some(remote), Some(_)) = (&handle.upload_to, &report.output) {
            match publisher.upload(&handle.sink, remote, handle.visibility).await {
                Ok(()) => report.uploaded = true,
                Err(e) => report.add_note(format!("upload failed: {}", e)),
            }
        }

        if let Some(ref note) = report.note {
            warn!("Background task {}: {}", report.name, note);
        }
        report.drained_at = Utc::now();
        report
    }
}
