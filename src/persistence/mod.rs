//! Persistence layer for run history

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{RunState, StepOutcome};
use crate::execution::RunReport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub state: RunState,

    /// The run deadline cancelled work
    pub cancelled: bool,

    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    pub total_steps: usize,
    pub succeeded_steps: usize,

    /// Failed, timed out or cancelled steps
    pub failed_steps: usize,
    pub skipped_steps: usize,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// Runs of one pipeline, newest first
    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>>;

    /// Latest runs across all pipelines, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>>;
}

/// In-memory persistence (for testing or `--no-history` runs)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sorted<F>(&self, keep: F) -> Vec<RunSummary>
    where
        F: Fn(&RunSummary) -> bool,
    {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs.values().filter(|r| keep(r)).cloned().collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        Ok(self.sorted(|r| r.pipeline_name == pipeline_name).await)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let mut runs = self.sorted(|_| true).await;
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Create a summary from a run report
pub fn create_summary(report: &RunReport) -> RunSummary {
    RunSummary {
        run_id: report.run_id,
        pipeline_name: report.pipeline_name.clone(),
        state: report.state,
        cancelled: report.cancelled,
        exit_code: report.exit_code(),
        started_at: report.started_at,
        completed_at: report.completed_at,
        total_steps: report.steps.len(),
        succeeded_steps: report.count(StepOutcome::Succeeded),
        failed_steps: report.steps.iter().filter(|r| r.outcome.is_failure()).count(),
        skipped_steps: report.count(StepOutcome::Skipped),
    }
}
