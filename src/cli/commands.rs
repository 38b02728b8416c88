//! CLI command definitions

use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Fact overrides (key=value), applied over the environment snapshot
    #[arg(long, value_parser = parse_key_value)]
    pub fact: Vec<(String, String)>,

    /// Write the run report as JSON
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Publish artifacts by copying them under this directory
    #[arg(long, conflicts_with = "dry_run_publish")]
    pub artifact_dir: Option<PathBuf>,

    /// Log uploads instead of performing them
    #[arg(long)]
    pub dry_run_publish: bool,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,

    /// Directory steps run in (defaults to the current directory)
    #[arg(long)]
    pub workdir: Option<PathBuf>,
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
