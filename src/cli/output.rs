//! CLI output formatting

use crate::{
    core::{Phase, RunState, StepOutcome, StepRecord},
    execution::{BackgroundReport, ExecutionEvent, RunReport},
    persistence::RunSummary,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a spinner shown while a step runs
pub fn create_step_spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
    {
        spinner.set_style(template);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a step outcome for display
pub fn format_outcome(outcome: StepOutcome) -> String {
    match outcome {
        StepOutcome::Succeeded => style("SUCCEEDED").green().to_string(),
        StepOutcome::Failed => style("FAILED").red().to_string(),
        StepOutcome::TimedOut => style("TIMED OUT").red().to_string(),
        StepOutcome::Cancelled => style("CANCELLED").yellow().to_string(),
        StepOutcome::Skipped => style("SKIPPED").dim().to_string(),
    }
}

/// Format a run state for display
pub fn format_state(state: RunState) -> String {
    match state {
        RunState::NotStarted => style("NOT STARTED").dim().to_string(),
        RunState::Running => style("RUNNING").yellow().to_string(),
        RunState::Succeeded => style("SUCCEEDED").green().to_string(),
        RunState::Failed => style("FAILED").red().to_string(),
    }
}

fn outcome_icon(outcome: StepOutcome) -> Emoji<'static, 'static> {
    match outcome {
        StepOutcome::Succeeded => CHECK,
        StepOutcome::Skipped => SKIP,
        StepOutcome::Cancelled => WARN,
        StepOutcome::Failed | StepOutcome::TimedOut => CROSS,
    }
}

/// Format an execution event for display. Returns None for events that are
/// rendered elsewhere.
pub fn format_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::RunStarted {
            run_id,
            pipeline_name,
            total_steps,
        } => format!(
            "{} Starting {} ({} steps, run {})",
            ROCKET,
            style(pipeline_name).bold(),
            total_steps,
            style(&run_id.to_string()[..8]).dim()
        ),
        ExecutionEvent::BackgroundStarted { name, sink } => format!(
            "{} Background task {} writing to {}",
            INFO,
            style(name).cyan(),
            style(sink.display()).dim()
        ),
        ExecutionEvent::StepSkipped { step_id, reason, .. } => format!(
            "{} {} skipped: {}",
            SKIP,
            style(step_id).dim(),
            style(reason).dim()
        ),
        ExecutionEvent::StepRetrying {
            step_id,
            attempt,
            max_attempts,
        } => format!(
            "{} {} (attempt {}/{})",
            WARN,
            style(step_id).yellow(),
            attempt,
            max_attempts
        ),
        ExecutionEvent::StepFinished {
            step_id,
            result,
            tolerated,
        } => {
            let mut line = format!(
                "{} {} {} in {}",
                outcome_icon(result.outcome),
                style(step_id).bold(),
                format_outcome(result.outcome),
                format_duration(result.duration)
            );
            if let Some(code) = result.exit_code.filter(|c| *c != 0) {
                line.push_str(&format!(" (exit {})", code));
            }
            if *tolerated {
                line.push_str(&style(" [continue on error]").yellow().to_string());
            }
            line
        }
        ExecutionEvent::FactDeclared { step_id, name, value } => format!(
            "{} {} set {} = {}",
            INFO,
            style(step_id).dim(),
            style(name).cyan(),
            style(value).dim()
        ),
        ExecutionEvent::BackgroundDrained { report } => format_background(report),
        ExecutionEvent::DeadlineExceeded { deadline } => format!(
            "{} Run deadline of {} exceeded",
            WARN,
            style(format_duration(*deadline)).red()
        ),
        ExecutionEvent::StepStarted { .. } | ExecutionEvent::RunFinished { .. } => return None,
    };
    Some(line)
}

fn format_background(report: &BackgroundReport) -> String {
    let mut line = format!(
        "{} Background task {} drained",
        INFO,
        style(&report.name).cyan()
    );
    if let Some(bytes) = report.bytes {
        line.push_str(&format!(", {} bytes", bytes));
    }
    if report.uploaded {
        line.push_str(", uploaded");
    }
    if let Some(note) = &report.note {
        line.push_str(&format!(" ({})", style(note).yellow()));
    }
    line
}

/// Table of every step in a finished run
pub fn format_run_report(report: &RunReport) -> String {
    let width = report
        .steps
        .iter()
        .map(|r| r.display_name.chars().count())
        .max()
        .unwrap_or(0);

    let mut lines = Vec::with_capacity(report.steps.len() + 2);
    lines.push(format!("{}", style("Summary").bold()));
    for record in &report.steps {
        lines.push(format_record(record, width));
    }
    lines.push(format!(
        "{} {} ({} succeeded, {} failed, {} skipped) in {}s",
        outcome_icon(if report.succeeded() {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed
        }),
        format_state(report.state),
        report.count(StepOutcome::Succeeded),
        report.count(StepOutcome::Failed)
            + report.count(StepOutcome::TimedOut)
            + report.count(StepOutcome::Cancelled),
        report.count(StepOutcome::Skipped),
        report.duration_secs()
    ));
    lines.join("\n")
}

fn format_record(record: &StepRecord, width: usize) -> String {
    let phase = match record.phase {
        Phase::Main => "",
        Phase::Deploy => " (deploy)",
    };
    let detail = match (&record.result, &record.skip_reason) {
        (_, Some(reason)) => style(reason.as_str()).dim().to_string(),
        (Some(result), None) if result.attempts > 1 => format!(
            "{} after {} attempts",
            format_duration(result.duration),
            result.attempts
        ),
        (Some(result), None) => format_duration(result.duration),
        (None, None) => String::new(),
    };
    format!(
        "  {}{:<width$}{} {} {}",
        outcome_icon(record.outcome),
        record.display_name,
        phase,
        format_outcome(record.outcome),
        detail,
        width = width
    )
}

/// Format a stored run for the history listing
pub fn format_run_summary(summary: &RunSummary) -> String {
    let icon = match summary.state {
        RunState::Succeeded => CHECK,
        RunState::Failed => CROSS,
        _ => INFO,
    };

    let mut line = format!(
        "{} {} - {} - {} ({}/{} ran, {} skipped) - {}",
        icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.pipeline_name).bold(),
        format_state(summary.state),
        summary.succeeded_steps,
        summary.total_steps,
        summary.skipped_steps,
        style(summary.started_at.format("%Y-%m-%d %H:%M:%S")).dim()
    );
    if summary.cancelled {
        line.push_str(&style(" [deadline]").yellow().to_string());
    }
    line
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Keep the last `max_lines` lines of step output
pub fn format_output_tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.trim_end().to_string()
    } else {
        format!(
            "{} ({} earlier lines)\n{}",
            style("[truncated]").dim(),
            lines.len() - max_lines,
            lines[lines.len() - max_lines..].join("\n")
        )
    }
}
