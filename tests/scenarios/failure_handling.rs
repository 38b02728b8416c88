//! Test: sticky failure, continue on error and failure handlers

use crate::helpers::*;
use stepline::core::StepOutcome;

#[tokio::test]
async fn test_continue_on_error_keeps_status() {
    let yaml = r#"
name: "Test: Continue On Error"
steps:
  - id: "lint"
    run: "lint"
    continue_on_error: true
  - id: "build"
    run: "build"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let host = ScriptedHost::new().on("lint", Reply::exit(3));
    let result = run_scenario(&pipeline, host).await;

    assert_outcome(&result, "lint", StepOutcome::Failed);
    assert_outcome(&result, "build", StepOutcome::Succeeded);
    assert!(result.report.step("lint").unwrap().tolerated);
    assert_run_succeeded(&result);
}

#[tokio::test]
async fn test_failure_is_sticky() {
    let yaml = r#"
name: "Test: Sticky Failure"
steps:
  - id: "compile"
    run: "compile"
  - id: "report"
    run: "report"
    condition: "always()"
  - id: "tests"
    run: "tests"
  - id: "tolerant"
    run: "tolerant"
    condition: "always()"
    continue_on_error: true
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let host = ScriptedHost::new().on("compile", Reply::exit(2));
    let result = run_scenario(&pipeline, host).await;

    // Steps that succeed after the failure do not reset the status
    assert_outcome(&result, "report", StepOutcome::Succeeded);
    assert_outcome(&result, "tests", StepOutcome::Skipped);
    assert_outcome(&result, "tolerant", StepOutcome::Succeeded);
    assert_run_failed(&result);
    assert_eq!(
        result.report.step("tests").unwrap().skip_reason.as_deref(),
        Some("an earlier step failed")
    );
}

#[tokio::test]
async fn test_failure_handler_runs_only_after_failure() {
    let yaml = r#"
name: "Test: Failure Handler"
steps:
  - id: "build"
    run: "build"
  - id: "collect_logs"
    run: "collect-logs"
    condition: "failed()"
  - id: "notify"
    run: "notify"
    condition: "and(failed(), eq(OS, 'Linux'))"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[("OS", "Linux")]);

    let passing = run_scenario(&pipeline, ScriptedHost::new()).await;
    assert_outcome(&passing, "collect_logs", StepOutcome::Skipped);
    assert_outcome(&passing, "notify", StepOutcome::Skipped);
    assert_run_succeeded(&passing);

    let failing = run_scenario(&pipeline, ScriptedHost::new().on("build", Reply::exit(1))).await;
    assert_outcome(&failing, "collect_logs", StepOutcome::Succeeded);
    assert_outcome(&failing, "notify", StepOutcome::Succeeded);
    assert_commands(&failing, &["build", "collect-logs", "notify"]);
    assert_run_failed(&failing);
}

#[tokio::test]
async fn test_failure_handler_with_continue_on_error_is_orthogonal() {
    let yaml = r#"
name: "Test: Orthogonal Controls"
steps:
  - id: "build"
    run: "build"
    continue_on_error: true
  - id: "on_failure"
    run: "on-failure"
    condition: "failed()"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let result = run_scenario(&pipeline, ScriptedHost::new().on("build", Reply::exit(1))).await;

    // A tolerated failure never flips the status, so failed() stays false
    assert_outcome(&result, "on_failure", StepOutcome::Skipped);
    assert_run_succeeded(&result);
}

#[tokio::test]
async fn test_timeout_is_reported_distinctly() {
    let yaml = r#"
name: "Test: Timeout"
steps:
  - id: "hang"
    run: "hang"
    timeout_secs: 1
  - id: "after"
    run: "after"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let host = ScriptedHost::new().on(
        "hang",
        Reply::exit(0).delay(std::time::Duration::from_secs(30)),
    );
    let result = run_scenario(&pipeline, host).await;

    assert_outcome(&result, "hang", StepOutcome::TimedOut);
    assert_outcome(&result, "after", StepOutcome::Skipped);
    assert_run_failed(&result);
    assert_eq!(result.report.exit_code(), 1);
    assert!(!result.report.cancelled);
}

#[tokio::test]
async fn test_step_env_overrides_stay_with_step() {
    let yaml = r#"
name: "Test: Env Overrides"
steps:
  - id: "container"
    run: "container"
    env: { IMAGE: "ubuntu:22.04" }
  - id: "native"
    run: "native"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let result = run_scenario(&pipeline, ScriptedHost::new()).await;

    let image = |i: usize| result.calls[i].env.get("IMAGE").cloned();
    assert_eq!(image(0), Some("ubuntu:22.04".to_string()));
    assert_eq!(image(1), Some(String::new()));
    assert_eq!(
        result.calls[1].env.get("STEPLINE_STEP_ID").map(String::as_str),
        Some("native")
    );
}
