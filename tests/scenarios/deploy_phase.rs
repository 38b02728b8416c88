//! Test: deploy phase gated by deploy flags

use crate::helpers::*;
use std::path::Path;
use stepline::core::{Phase, StepOutcome, Visibility};

const PIPELINE: &str = r#"
name: "Test: Deploy"
steps:
  - id: "build"
    run: "build"
deploy:
  - id: "upload"
    publish: { path: "dist/app.tar.gz", to: "builds/app.tar.gz", visibility: public }
    condition: "and(succeeded(), eq(DEPLOY, '1'))"
  - id: "upload_alt"
    publish: { path: "dist/app.tar.gz", to: "alt/app.tar.gz" }
    condition: "and(succeeded(), eq(DEPLOY_ALT, '1'))"
"#;

#[tokio::test]
async fn test_deploy_skipped_when_flag_unset() {
    let pipeline = pipeline_from_yaml(PIPELINE, &[]);
    let result = run_scenario(&pipeline, ScriptedHost::new()).await;

    assert_outcome(&result, "build", StepOutcome::Succeeded);
    assert_outcome(&result, "upload", StepOutcome::Skipped);
    assert_outcome(&result, "upload_alt", StepOutcome::Skipped);
    assert!(result.uploads.is_empty(), "no upload should be issued");
    assert_run_succeeded(&result);
}

#[tokio::test]
async fn test_deploy_uploads_when_flag_set() {
    let workspace = tempfile::tempdir().unwrap();
    let pipeline = pipeline_from_yaml(PIPELINE, &[("DEPLOY", "1")]);
    let result = run_scenario_with(
        &pipeline,
        ScriptedHost::new(),
        RecordingPublisher::new(),
        Some(workspace.path()),
    )
    .await;

    assert_outcome(&result, "upload", StepOutcome::Succeeded);
    assert_outcome(&result, "upload_alt", StepOutcome::Skipped);
    assert_eq!(
        result.uploads,
        vec![Upload {
            local: workspace.path().join("dist/app.tar.gz"),
            remote: "builds/app.tar.gz".to_string(),
            visibility: Visibility::Public,
        }]
    );
    assert_eq!(result.report.step("upload").unwrap().phase, Phase::Deploy);
}

#[tokio::test]
async fn test_deploy_skipped_after_failure() {
    let pipeline = pipeline_from_yaml(PIPELINE, &[("DEPLOY", "1"), ("DEPLOY_ALT", "1")]);
    let result = run_scenario(&pipeline, ScriptedHost::new().on("build", Reply::exit(1))).await;

    assert_outcome(&result, "upload", StepOutcome::Skipped);
    assert_outcome(&result, "upload_alt", StepOutcome::Skipped);
    assert!(result.uploads.is_empty());
    assert_run_failed(&result);
}

#[tokio::test]
async fn test_failed_upload_fails_the_run() {
    let pipeline = pipeline_from_yaml(PIPELINE, &[("DEPLOY", "1"), ("DEPLOY_ALT", "1")]);
    let result = run_scenario_with(
        &pipeline,
        ScriptedHost::new(),
        RecordingPublisher::failing(),
        Some(Path::new("/tmp")),
    )
    .await;

    assert_outcome(&result, "upload", StepOutcome::Failed);
    // The second upload is gated on succeeded()
    assert_outcome(&result, "upload_alt", StepOutcome::Skipped);
    assert_eq!(result.uploads.len(), 1);
    assert_run_failed(&result);
}
