//! SQLite-based run history store

use crate::core::RunState;
use crate::persistence::{PersistenceBackend, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const COLUMNS: &str = "id, pipeline_name, state, cancelled, exit_code, started_at, completed_at, \
     total_steps, succeeded_steps, failed_steps, skipped_steps";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (creating if needed) a store at `db_path`
    pub async fn new(db_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("Failed to open history database {}", db_path.display()))?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Default location of the history database
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stepline")
            .join("runs.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let db_path = Self::default_path();
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Self::new(&db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                pipeline_name TEXT NOT NULL,
                state TEXT NOT NULL,
                cancelled INTEGER NOT NULL DEFAULT 0,
                exit_code INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT NOT NULL,
                total_steps INTEGER NOT NULL DEFAULT 0,
                succeeded_steps INTEGER NOT NULL DEFAULT 0,
                failed_steps INTEGER NOT NULL DEFAULT 0,
                skipped_steps INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_runs_pipeline ON runs(pipeline_name);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize history schema")?;

        Ok(())
    }

    fn parse_state(value: &str) -> RunState {
        match value {
            "Succeeded" => RunState::Succeeded,
            "Failed" => RunState::Failed,
            "Running" => RunState::Running,
            _ => RunState::NotStarted,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            state: Self::parse_state(&row.get::<String, _>("state")),
            cancelled: row.get("cancelled"),
            exit_code: row.get("exit_code"),
            started_at: from_naive(row.get("started_at")),
            completed_at: from_naive(row.get("completed_at")),
            total_steps: row.get::<i64, _>("total_steps") as usize,
            succeeded_steps: row.get::<i64, _>("succeeded_steps") as usize,
            failed_steps: row.get::<i64, _>("failed_steps") as usize,
            skipped_steps: row.get::<i64, _>("skipped_steps") as usize,
        })
    }
}

fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(dt, Utc)
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            COLUMNS
        ))
        .bind(run.run_id.to_string())
        .bind(&run.pipeline_name)
        .bind(format!("{:?}", run.state))
        .bind(run.cancelled)
        .bind(run.exit_code)
        .bind(run.started_at.naive_utc())
        .bind(run.completed_at.naive_utc())
        .bind(run.total_steps as i64)
        .bind(run.succeeded_steps as i64)
        .bind(run.failed_steps as i64)
        .bind(run.skipped_steps as i64)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?1",
            COLUMNS
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list recent runs")?;

        rows.iter().map(Self::from_row).collect()
    }
}
