//! Test: facts declared at runtime by steps

use crate::helpers::*;
use stepline::core::StepOutcome;
use stepline::execution::ExecutionEvent;

#[tokio::test]
async fn test_declared_fact_visible_only_to_later_steps() {
    let yaml = r#"
name: "Test: Declared Facts"
steps:
  - id: "detect"
    run: "detect"
  - id: "nightly_only"
    run: "nightly"
    condition: "eq(CHANNEL, 'nightly')"
  - id: "stable_only"
    run: "stable"
    condition: "eq(CHANNEL, 'stable')"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let host = ScriptedHost::new().on(
        "detect",
        Reply::exit(0).stdout("checking...\n::set-fact name=CHANNEL::nightly\ndone\n"),
    );
    let result = run_scenario(&pipeline, host).await;

    assert_outcome(&result, "nightly_only", StepOutcome::Succeeded);
    assert_outcome(&result, "stable_only", StepOutcome::Skipped);

    // The declaring step never saw its own fact
    assert_eq!(result.calls[0].env.get("CHANNEL"), None);
    assert_eq!(
        result.calls[1].env.get("CHANNEL").map(String::as_str),
        Some("nightly")
    );

    let declared = result.count_events(|e| {
        matches!(e, ExecutionEvent::FactDeclared { name, value, .. } if name == "CHANNEL" && value == "nightly")
    });
    assert_eq!(declared, 1);
}

#[tokio::test]
async fn test_later_declaration_shadows_earlier() {
    let yaml = r#"
name: "Test: Shadowing"
steps:
  - id: "first"
    run: "first"
  - id: "second"
    run: "second"
  - id: "reader"
    run: "reader"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[("IMAGE", "base")]);
    let host = ScriptedHost::new()
        .on("first", Reply::exit(0).stdout("::set-fact name=IMAGE::alpine\n"))
        .on("second", Reply::exit(0).stdout("::set-fact name=IMAGE::debian\n"));
    let result = run_scenario(&pipeline, host).await;

    let image = |i: usize| result.calls[i].env.get("IMAGE").cloned().unwrap();
    assert_eq!(image(0), "base");
    assert_eq!(image(1), "alpine");
    assert_eq!(image(2), "debian");
}

#[tokio::test]
async fn test_failed_step_can_still_declare() {
    let yaml = r#"
name: "Test: Declaration From Failed Step"
steps:
  - id: "detect_toolchain"
    run: "detect_toolchain"
    continue_on_error: true
  - id: "fallback"
    run: "fallback"
    condition: "eq(TOOLCHAIN, 'missing')"
"#;
    let pipeline = pipeline_from_yaml(yaml, &[]);
    let host = ScriptedHost::new().on(
        "detect_toolchain",
        Reply::exit(1).stdout("::set-fact name=TOOLCHAIN::missing\n"),
    );
    let result = run_scenario(&pipeline, host).await;

    assert_outcome(&result, "detect_toolchain", StepOutcome::Failed);
    assert_outcome(&result, "fallback", StepOutcome::Succeeded);
    assert_run_succeeded(&result);
}
