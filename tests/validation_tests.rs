//! Integration tests for the validator pipeline, auto-fix, and sandbox
//! scoring.

use tokio_util::sync::CancellationToken;

use nucleus_core::manifest::{PluginArtifact, PluginManifest};
use nucleus_core::sandbox::{aggregate_score, SandboxHarness, SandboxPolicy};
use nucleus_core::validator::{autofix, FindingKind, Severity, ValidatorPipeline};

fn artifact(manifest_json: &str, code: &str) -> PluginArtifact {
    PluginArtifact::new(PluginManifest::from_json(manifest_json).unwrap(), code)
}

fn clean() -> PluginArtifact {
    artifact(
        r#"{"id": "clean", "version": "1.0.0"}"#,
        "fn init() { }\nfn metadata() { #{} }\nfn destroy() { }",
    )
}

#[test]
fn test_clean_plugin_scores_perfect() {
    let report = ValidatorPipeline::new(true).validate(&clean());
    assert!(report.valid);
    assert!(report.safe);
    assert_eq!(report.score, 100);
    assert_eq!(report.security_score, 100);
    assert_eq!(report.performance_score, 100);
    assert!(report.findings.is_empty());
}

#[test]
fn test_score_never_underflows() {
    // Pile enough penalties on one plugin to exceed 100.
    let code = r#"
        fn init() {
            eval("a"); eval("b"); eval("c");
            eval("d"); eval("e"); eval("f");
        }
        fn metadata() { #{} }
    "#;
    let report = ValidatorPipeline::new(true)
        .validate(&artifact(r#"{"id": "bad", "version": "1.0.0"}"#, code));
    assert_eq!(report.score, 0);
    assert!(!report.safe);
}

#[test]
fn test_safe_tracks_high_security_findings_exactly() {
    // Medium security findings alone leave the plugin safe.
    let medium = artifact(
        r#"{"id": "med", "version": "1.0.0",
            "permissions": ["file-access"]}"#,
        "fn init() { read_file(\"notes.txt\"); }\nfn metadata() { #{} }",
    );
    let report = ValidatorPipeline::new(true).validate(&medium);
    assert!(report
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::FilesystemAccess && f.severity == Severity::Medium));
    assert!(report.safe);

    let high = artifact(
        r#"{"id": "high", "version": "1.0.0"}"#,
        "fn init() { eval(\"x\"); }\nfn metadata() { #{} }",
    );
    assert!(!ValidatorPipeline::new(true).validate(&high).safe);
}

#[test]
fn test_permission_drift_both_directions() {
    let drifted = artifact(
        r#"{"id": "drift", "version": "1.0.0",
            "permissions": ["ui-access"]}"#,
        "fn init() { http_get(\"https://example.org\"); }\nfn metadata() { #{} }",
    );
    let report = ValidatorPipeline::new(true).validate(&drifted);

    // network used but not declared
    assert!(report
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::UndeclaredPermissionUse));
    // ui declared but never used
    assert!(report
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::UnusedPermission && f.severity == Severity::Info));
}

#[test]
fn test_security_pass_can_be_disabled() {
    let risky = artifact(
        r#"{"id": "risky", "version": "1.0.0"}"#,
        "fn init() { eval(\"x\"); }\nfn metadata() { #{} }",
    );
    let report = ValidatorPipeline::new(false).validate(&risky);
    assert!(report.safe);
    assert!(!report
        .findings
        .iter()
        .any(|f| f.kind == FindingKind::DynamicCodeEvaluation));
}

#[test]
fn test_autofix_rewrites_string_timer_and_raw_html() {
    let fixable = artifact(
        r#"{"id": "fixable", "version": "1.0.0",
            "permissions": ["ui-access"]}"#,
        concat!(
            "fn init() {\n",
            "    set_timeout(\"tick()\", 100);\n",
            "    ui_set_panel_raw_html(\"panel\", body);\n",
            "}\n",
            "fn metadata() { #{} }\n",
        ),
    );
    let (fixed, applied) = autofix(&fixable);

    assert_eq!(applied.len(), 2);
    assert!(applied.iter().any(|f| f.rule == "string-timer-to-closure"));
    assert!(applied.iter().any(|f| f.rule == "raw-html-to-escaped"));
    assert!(fixed.code.contains("set_timeout(|| tick(), 100)"));
    assert!(fixed.code.contains("ui_set_panel_html("));
    // The input artifact is untouched.
    assert!(fixable.code.contains("set_timeout(\"tick()\""));

    // Fixed code carries neither original finding.
    let report = ValidatorPipeline::new(true).validate(&fixed);
    assert!(!report.findings.iter().any(|f| {
        f.kind == FindingKind::StringTimerCallback || f.kind == FindingKind::UnescapedHtmlSink
    }));
}

#[test]
fn test_autofix_on_clean_code_is_identity() {
    let (fixed, applied) = autofix(&clean());
    assert!(applied.is_empty());
    assert_eq!(fixed.code, clean().code);
}

#[tokio::test]
async fn test_aggregate_score_combines_report_and_session() {
    let plugin = clean();
    let report = ValidatorPipeline::new(true).validate(&plugin);
    let harness = SandboxHarness::new(SandboxPolicy::default());
    let session = harness
        .run(&plugin, &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.passed);
    assert_eq!(aggregate_score(&report, &session), 100);
}

#[tokio::test]
async fn test_aggregate_score_drops_with_failed_sandbox() {
    let plugin = artifact(
        r#"{"id": "flaky", "version": "1.0.0"}"#,
        "fn init() { throw \"boom\"; }\nfn metadata() { #{} }",
    );
    let report = ValidatorPipeline::new(true).validate(&plugin);
    let harness = SandboxHarness::new(SandboxPolicy::default());
    let session = harness
        .run(&plugin, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!session.passed);
    // valid + security + performance pass, the sandbox quarter is lost.
    assert_eq!(aggregate_score(&report, &session), 75);
}

#[tokio::test]
async fn test_leaked_timers_are_reported_and_cleared() {
    let plugin = artifact(
        r#"{"id": "leaky", "version": "1.0.0"}"#,
        concat!(
            "fn init() {\n",
            "    set_interval(|| poll(), 50);\n",
            "    let t = set_timeout(|| once(), 100);\n",
            "    clear_timeout(t);\n",
            "}\n",
            "fn metadata() { #{} }\n",
            "fn destroy() { }\n",
        ),
    );
    let harness = SandboxHarness::new(SandboxPolicy::default());
    let session = harness
        .run(&plugin, &CancellationToken::new())
        .await
        .unwrap();

    assert!(session.passed);
    // The interval survived destroy; the timeout was released.
    assert_eq!(session.leaked_timers, 1);
}
