//! Test: background task drained exactly once at teardown

#![cfg(unix)]

use crate::helpers::*;
use std::time::Duration;
use stepline::core::{StepOutcome, Visibility};
use stepline::execution::ExecutionEvent;

const PIPELINE: &str = r#"
name: "Test: Background Sampler"
background:
  name: "cpu-usage"
  command: "while true; do echo sample; sleep 0.05; done"
  sink: "cpu-usage.csv"
  upload_to: "logs/cpu-usage.csv"
steps:
  - id: "build"
    run: "build"
  - id: "test"
    run: "test"
deploy:
  - id: "upload"
    publish: { path: "dist/app.tar.gz", to: "builds/app.tar.gz" }
    condition: "always()"
"#;

fn drained(result: &ScenarioResult) -> usize {
    result.count_events(|e| matches!(e, ExecutionEvent::BackgroundDrained { .. }))
}

#[tokio::test]
async fn test_background_drained_and_uploaded_once() {
    let workspace = tempfile::tempdir().unwrap();
    let pipeline = pipeline_from_yaml(PIPELINE, &[]);
    let host = ScriptedHost::new().on("build", Reply::exit(0).delay(Duration::from_millis(200)));

    let result = run_scenario_with(
        &pipeline,
        host,
        RecordingPublisher::new(),
        Some(workspace.path()),
    )
    .await;

    assert_run_succeeded(&result);
    assert_eq!(drained(&result), 1);

    let background = result.report.background.as_ref().expect("background report");
    assert!(background.uploaded, "note: {:?}", background.note);
    assert!(background.bytes.unwrap_or(0) > 0);

    // The sink upload lands before the deploy phase
    assert_eq!(result.uploads.len(), 2);
    assert_eq!(result.uploads[0].local, workspace.path().join("cpu-usage.csv"));
    assert_eq!(result.uploads[0].remote, "logs/cpu-usage.csv");
    assert_eq!(result.uploads[0].visibility, Visibility::Private);
    assert_eq!(result.uploads[1].remote, "builds/app.tar.gz");
}

#[tokio::test]
async fn test_background_drained_when_a_step_fails() {
    let workspace = tempfile::tempdir().unwrap();
    let pipeline = pipeline_from_yaml(PIPELINE, &[]);
    let host = ScriptedHost::new().on(
        "build",
        Reply::exit(2).delay(Duration::from_millis(200)),
    );

    let result = run_scenario_with(
        &pipeline,
        host,
        RecordingPublisher::new(),
        Some(workspace.path()),
    )
    .await;

    assert_outcome(&result, "build", StepOutcome::Failed);
    assert_outcome(&result, "test", StepOutcome::Skipped);
    assert_outcome(&result, "upload", StepOutcome::Succeeded);
    assert_run_failed(&result);

    assert_eq!(drained(&result), 1);
    let sink_uploads = result
        .uploads
        .iter()
        .filter(|u| u.remote == "logs/cpu-usage.csv")
        .count();
    assert_eq!(sink_uploads, 1);
}

#[tokio::test]
async fn test_background_start_failure_does_not_fail_run() {
    let workspace = tempfile::tempdir().unwrap();
    // A regular file where the sink's parent directory should be
    std::fs::write(workspace.path().join("blocker"), b"").unwrap();

    let yaml = r#"
name: "Test: Broken Sampler"
background:
  command: "echo sample"
  sink: "blocker/cpu-usage.csv"
  upload_to: "logs/cpu-usage.csv"
steps:
  - id: "build"
    run: "build"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let result = run_scenario_with(
        &pipeline,
        ScriptedHost::new(),
        RecordingPublisher::new(),
        Some(workspace.path()),
    )
    .await;

    assert_run_succeeded(&result);
    assert_eq!(drained(&result), 1);
    assert_eq!(
        result.count_events(|e| matches!(e, ExecutionEvent::BackgroundStarted { .. })),
        0
    );

    let background = result.report.background.as_ref().unwrap();
    assert!(!background.uploaded);
    assert!(background.note.as_deref().unwrap().starts_with("not started"));
    assert!(result.uploads.is_empty());
}

#[tokio::test]
async fn test_silent_background_is_not_uploaded() {
    let workspace = tempfile::tempdir().unwrap();
    let yaml = r#"
name: "Test: Silent Sampler"
background:
  command: "sleep 5"
  sink: "cpu-usage.csv"
  upload_to: "logs/cpu-usage.csv"
steps:
  - id: "build"
    run: "build"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let result = run_scenario_with(
        &pipeline,
        ScriptedHost::new(),
        RecordingPublisher::new(),
        Some(workspace.path()),
    )
    .await;

    assert_run_succeeded(&result);
    let background = result.report.background.as_ref().unwrap();
    assert!(!background.uploaded);
    assert_eq!(background.note.as_deref(), Some("task produced no output"));
    assert!(result.uploads.is_empty());
}
