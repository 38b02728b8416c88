use anyhow::{Context, Result};
use std::sync::Arc;
use stepline::cli::commands::{HistoryCommand, RunCommand, ValidateCommand};
use stepline::cli::output::*;
use stepline::cli::terminal_output::TerminalReporter;
use stepline::cli::{Cli, Command};
use stepline::core::config::PipelineConfig;
use stepline::execution::{
    ArtifactPublisher, DirectoryPublisher, DryRunPublisher, ExecutionEngine, ShellHost,
};
use stepline::persistence::{create_summary, InMemoryPersistence, PersistenceBackend};
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // RUST_LOG wins over --verbose when set
    let log_level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    match &cli.command {
        Command::Run(cmd) => {
            let code = run_pipeline(cmd, cli.verbose).await?;
            std::process::exit(code);
        }
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn run_pipeline(cmd: &RunCommand, verbose: bool) -> Result<i32> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load pipeline config")?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline();
    for (key, value) in &cmd.fact {
        pipeline.facts.overrides.push((key.clone(), value.clone()));
        println!(
            "{} Fact override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let workspace = match &cmd.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    let publisher: Box<dyn ArtifactPublisher> = if cmd.dry_run_publish {
        Box::new(DryRunPublisher)
    } else {
        let root = cmd
            .artifact_dir
            .clone()
            .unwrap_or_else(|| workspace.join(".stepline").join("artifacts"));
        println!("{} Publishing artifacts to {}", INFO, style(root.display()).dim());
        Box::new(DirectoryPublisher::new(root))
    };

    let store = open_store(cmd.no_history).await;

    let engine =
        ExecutionEngine::new(ShellHost::default(), publisher).with_workspace(workspace);

    let reporter = Arc::new(TerminalReporter::new(pipeline.total_steps(), verbose));
    engine
        .add_event_handler(move |event| reporter.handle(&event))
        .await;

    println!();
    let report = engine.execute(&pipeline).await;

    println!("\n{}", format_run_report(&report));

    if let Some(path) = &cmd.report {
        report.write_json(path)?;
        println!("{} Report written to {}", INFO, style(path.display()).dim());
    }

    if !cmd.no_history {
        let summary = create_summary(&report);
        match store.save_run(&summary).await {
            Ok(()) => println!(
                "{} Run saved to history (ID: {})",
                INFO,
                style(&summary.run_id.to_string()[..8]).dim()
            ),
            Err(e) => warn!("Failed to save run history: {:#}", e),
        }
    }

    if report.succeeded() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&pipeline.name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&pipeline.name).bold(),
            style(if report.cancelled { "cancelled by deadline" } else { "failed" }).red()
        );
    }

    Ok(report.exit_code())
}

/// History store for a run. Falls back to memory when the database is unavailable.
async fn open_store(no_history: bool) -> Arc<dyn PersistenceBackend> {
    if no_history {
        return Arc::new(InMemoryPersistence::new());
    }

    match history_store().await {
        Ok(store) => store,
        Err(e) => {
            warn!("History unavailable: {:#}", e);
            Arc::new(InMemoryPersistence::new())
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating pipeline...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Pipeline configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            println!("  Deploy steps: {}", style(config.deploy.len()).cyan());
            if let Some(background) = &config.background {
                println!("  Background task: {}", style(&background.name).cyan());
            }

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = history_store().await?;

    let runs = match &cmd.pipeline {
        Some(pipeline_name) => {
            let mut runs = store.list_runs(pipeline_name).await?;
            runs.truncate(cmd.limit);
            runs
        }
        None => store.list_recent(cmd.limit).await?,
    };

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    println!("{} Run history (showing latest {}):", INFO, cmd.limit);
    for summary in &runs {
        println!("  {}", format_run_summary(summary));
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(
        stepline::persistence::SqliteRunStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store() -> Result<Arc<dyn PersistenceBackend>> {
    anyhow::bail!("history requires the `sqlite` feature")
}
