//! Test: per-platform steps gated by the OS fact

use crate::helpers::*;
use stepline::core::StepOutcome;

const PIPELINE: &str = r#"
name: "Test: Platform Conditions"
steps:
  - id: "a"
    run: "step-a"
  - id: "b"
    run: "step-b"
    condition: "eq(OS, 'Linux')"
  - id: "c"
    run: "step-c"
"#;

fn host() -> ScriptedHost {
    ScriptedHost::new().on("step-b", Reply::exit(1))
}

#[tokio::test]
async fn test_linux_only_step_skipped_on_windows() {
    let pipeline = pipeline_from_yaml(PIPELINE, &[("OS", "Windows")]);
    let result = run_scenario(&pipeline, host()).await;

    assert_outcome(&result, "a", StepOutcome::Succeeded);
    assert_outcome(&result, "b", StepOutcome::Skipped);
    assert_outcome(&result, "c", StepOutcome::Succeeded);
    assert_commands(&result, &["step-a", "step-c"]);
    assert_run_succeeded(&result);

    let reason = result.report.step("b").unwrap().skip_reason.clone().unwrap();
    assert!(reason.contains("eq(OS, 'Linux')"), "{reason}");
}

#[tokio::test]
async fn test_linux_failure_skips_later_default_steps() {
    let pipeline = pipeline_from_yaml(PIPELINE, &[("OS", "Linux")]);
    let result = run_scenario(&pipeline, host()).await;

    assert_outcome(&result, "a", StepOutcome::Succeeded);
    assert_outcome(&result, "b", StepOutcome::Failed);
    assert_outcome(&result, "c", StepOutcome::Skipped);
    assert_commands(&result, &["step-a", "step-b"]);
    assert_run_failed(&result);
    assert_eq!(result.report.exit_code(), 1);
}

#[tokio::test]
async fn test_unknown_fact_is_tolerated() {
    let yaml = r#"
name: "Test: Unknown Fact"
steps:
  - id: "eq_unknown"
    run: "one"
    condition: "eq(NOT_A_FACT, 'x')"
  - id: "ne_unknown"
    run: "two"
    condition: "ne(NOT_A_FACT, 'x')"
  - id: "or_fallback"
    run: "three"
    condition: "or(eq(NOT_A_FACT, 'x'), eq(OS, 'Darwin'))"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[("OS", "Darwin")]);
    let result = run_scenario(&pipeline, ScriptedHost::new()).await;

    assert_outcome(&result, "eq_unknown", StepOutcome::Skipped);
    assert_outcome(&result, "ne_unknown", StepOutcome::Skipped);
    assert_outcome(&result, "or_fallback", StepOutcome::Succeeded);
    assert_run_succeeded(&result);
}

#[tokio::test]
async fn test_secret_presence_and_job_facts() {
    let yaml = r#"
name: "Test: Secrets"
job: "Linux_x64"
secrets: [STEPLINE_TEST_UNSET_SECRET]
steps:
  - id: "needs_secret"
    run: "sign"
    condition: "eq(secrets.STEPLINE_TEST_UNSET_SECRET, 'true')"
  - id: "job_gated"
    run: "package"
    condition: "eq(variables['JOB'], 'Linux_x64')"
"#;
    // Pin JOB in case STEPLINE_JOB is set in the test environment
    let pipeline = pipeline_from_yaml(yaml, &[("JOB", "Linux_x64")]);
    let result = run_scenario(&pipeline, ScriptedHost::new()).await;

    assert_outcome(&result, "needs_secret", StepOutcome::Skipped);
    assert_outcome(&result, "job_gated", StepOutcome::Succeeded);

    // Secret flags never reach the subprocess environment
    let env = &result.calls[0].env;
    assert!(env.keys().all(|k| !k.starts_with("secrets.")));
    assert_eq!(env.get("JOB").map(String::as_str), Some("Linux_x64"));
}
