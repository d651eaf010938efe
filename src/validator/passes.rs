//! The four validation passes.
//!
//! Passes are tagged variants over a shared capability set (`name`,
//! `apply`). Severity mapping and rule tables live here; composition and
//! scoring live in the parent module.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use super::{Finding, FindingKind, Severity};
use crate::manifest::{Permission, PluginArtifact};

// ═══════════════════════════════════════════════════════════════════════════════
// Pass Variants
// ═══════════════════════════════════════════════════════════════════════════════

/// A validation pass. Kept as tagged variants rather than open inheritance so
/// the pipeline stays a closed, auditable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPass {
    /// Parse the code into an executable form without executing it.
    Syntax,
    /// Verify the code exposes the entry points the manifest advertises.
    Structure,
    /// Pattern rules over security-sensitive constructs plus permission
    /// drift checks.
    Security,
    /// Performance hazards and a cyclomatic-complexity estimate.
    Performance,
}

impl ValidationPass {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Structure => "structure",
            Self::Security => "security",
            Self::Performance => "performance",
        }
    }

    /// Apply this pass to an artifact. Pure: inspects, never executes.
    pub fn apply(&self, artifact: &PluginArtifact) -> Vec<Finding> {
        match self {
            Self::Syntax => syntax_pass(artifact),
            Self::Structure => structure_pass(artifact),
            Self::Security => security_pass(artifact),
            Self::Performance => performance_pass(artifact),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Syntax Pass
// ═══════════════════════════════════════════════════════════════════════════════

fn syntax_pass(artifact: &PluginArtifact) -> Vec<Finding> {
    let engine = rhai::Engine::new();
    match engine.compile(&artifact.code) {
        Ok(_) => Vec::new(),
        Err(e) => {
            let mut finding = Finding::new(
                FindingKind::SyntaxError,
                Severity::High,
                format!("plugin code failed to parse: {e}"),
            );
            if let Some(line) = e.position().line() {
                finding = finding.at_line(line);
            }
            vec![finding]
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Structure Pass
// ═══════════════════════════════════════════════════════════════════════════════

/// Entry points every plugin must define.
const REQUIRED_ENTRY_POINTS: &[&str] = &["init", "metadata"];
/// Entry points a plugin should define.
const RECOMMENDED_ENTRY_POINTS: &[&str] = &["destroy"];

fn defines_function(code: &str, name: &str) -> bool {
    let pattern = format!(r"\bfn\s+{}\s*\(", regex::escape(name));
    Regex::new(&pattern).map(|re| re.is_match(code)).unwrap_or(false)
}

fn structure_pass(artifact: &PluginArtifact) -> Vec<Finding> {
    let mut findings = Vec::new();
    let code = &artifact.code;

    for entry in REQUIRED_ENTRY_POINTS {
        if !defines_function(code, entry) {
            findings.push(Finding::new(
                FindingKind::MissingEntryPoint,
                Severity::Medium,
                format!("required entry point '{entry}' is not defined"),
            ));
        }
    }

    for entry in RECOMMENDED_ENTRY_POINTS {
        if !defines_function(code, entry) {
            findings.push(Finding::new(
                FindingKind::MissingRecommendedEntryPoint,
                Severity::Low,
                format!("recommended entry point '{entry}' is not defined"),
            ));
        }
    }

    for function in &artifact.manifest.functions {
        if !defines_function(code, &function.name) {
            findings.push(Finding::new(
                FindingKind::MissingEntryPoint,
                Severity::Medium,
                format!(
                    "advertised function '{}' is not defined in the plugin code",
                    function.name
                ),
            ));
        }
    }

    findings
}

// ═══════════════════════════════════════════════════════════════════════════════
// Security Pass
// ═══════════════════════════════════════════════════════════════════════════════

struct SecurityRule {
    pattern: &'static str,
    kind: FindingKind,
    severity: Severity,
    message: &'static str,
    /// Permission implied by a match; checked against the manifest for
    /// declared-vs-used drift.
    permission: Option<Permission>,
}

const SECURITY_RULES: &[SecurityRule] = &[
    SecurityRule {
        pattern: r"\beval\s*\(",
        kind: FindingKind::DynamicCodeEvaluation,
        severity: Severity::High,
        message: "dynamic code evaluation",
        permission: None,
    },
    SecurityRule {
        pattern: r"raw_html\s*\(",
        kind: FindingKind::UnescapedHtmlSink,
        severity: Severity::Medium,
        message: "HTML sink assignment that bypasses escaping",
        permission: Some(Permission::UiAccess),
    },
    SecurityRule {
        pattern: r"\b(http_get|http_post|fetch)\s*\(",
        kind: FindingKind::OutboundNetworkCall,
        severity: Severity::Low,
        message: "outbound network invocation",
        permission: Some(Permission::NetworkAccess),
    },
    SecurityRule {
        pattern: r"\b(read_file|write_file)\s*\(",
        kind: FindingKind::FilesystemAccess,
        severity: Severity::Medium,
        message: "filesystem access",
        permission: Some(Permission::FileAccess),
    },
    SecurityRule {
        pattern: r#"set_(timeout|interval)\s*\(\s*""#,
        kind: FindingKind::StringTimerCallback,
        severity: Severity::Medium,
        message: "delayed callback with a string body",
        permission: None,
    },
];

/// Patterns that only establish permission usage, without a finding of their
/// own.
const USAGE_PATTERNS: &[(&str, Permission)] = &[
    (r"\bui_\w+\s*\(", Permission::UiAccess),
    (r"\bai_register_function\s*\(", Permission::AiAccess),
];

fn security_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        SECURITY_RULES
            .iter()
            .map(|r| Regex::new(r.pattern).expect("security rule pattern"))
            .collect()
    })
}

fn usage_regexes() -> &'static Vec<Regex> {
    static REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();
    REGEXES.get_or_init(|| {
        USAGE_PATTERNS
            .iter()
            .map(|(p, _)| Regex::new(p).expect("usage pattern"))
            .collect()
    })
}

fn security_pass(artifact: &PluginArtifact) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut used_permissions: Vec<Permission> = Vec::new();
    let regexes = security_regexes();

    for (line_no, line) in artifact.code.lines().enumerate() {
        for (rule, regex) in SECURITY_RULES.iter().zip(regexes) {
            if regex.is_match(line) {
                findings.push(
                    Finding::new(rule.kind, rule.severity, rule.message)
                        .at_line(line_no + 1),
                );
                if let Some(permission) = rule.permission {
                    if !used_permissions.contains(&permission) {
                        used_permissions.push(permission);
                    }
                }
            }
        }
        for ((_, permission), regex) in USAGE_PATTERNS.iter().zip(usage_regexes()) {
            if regex.is_match(line) && !used_permissions.contains(permission) {
                used_permissions.push(*permission);
            }
        }
    }

    // Declared-vs-used permission drift.
    for permission in &used_permissions {
        if !artifact.manifest.has_permission(*permission) {
            findings.push(Finding::new(
                FindingKind::UndeclaredPermissionUse,
                Severity::Medium,
                format!("code uses '{permission}' but the manifest does not declare it"),
            ));
        }
    }
    for permission in &artifact.manifest.permissions {
        if !used_permissions.contains(permission) {
            findings.push(Finding::new(
                FindingKind::UnusedPermission,
                Severity::Info,
                format!("manifest declares '{permission}' but the code never uses it"),
            ));
        }
    }

    findings
}

// ═══════════════════════════════════════════════════════════════════════════════
// Performance Pass
// ═══════════════════════════════════════════════════════════════════════════════

fn performance_pass(artifact: &PluginArtifact) -> Vec<Finding> {
    static LOOP_HEAD: OnceLock<Regex> = OnceLock::new();
    static SLEEP_CALL: OnceLock<Regex> = OnceLock::new();
    static DATA_QUERY: OnceLock<Regex> = OnceLock::new();
    let loop_head = LOOP_HEAD.get_or_init(|| Regex::new(r"\b(for|while|loop)\b").unwrap());
    let sleep_call = SLEEP_CALL.get_or_init(|| Regex::new(r"\bsleep\s*\(").unwrap());
    let data_query =
        DATA_QUERY.get_or_init(|| Regex::new(r"\bdata_(sequence|region|genome)\s*\(").unwrap());

    let mut findings = Vec::new();

    // Loop-body hazards: track brace depth and the depth at which each loop
    // was entered.
    let mut depth: i64 = 0;
    let mut loop_stack: Vec<i64> = Vec::new();

    for (line_no, line) in artifact.code.lines().enumerate() {
        let in_loop = !loop_stack.is_empty();
        let opens_loop = loop_head.is_match(line);

        if in_loop || opens_loop {
            if sleep_call.is_match(line) {
                findings.push(
                    Finding::new(
                        FindingKind::BlockingCallInLoop,
                        Severity::Medium,
                        "blocking sleep inside a serial loop",
                    )
                    .at_line(line_no + 1),
                );
            }
            if in_loop && data_query.is_match(line) {
                findings.push(
                    Finding::new(
                        FindingKind::QueryInLoop,
                        Severity::Low,
                        "host data query inside a loop; hoist or cache the result",
                    )
                    .at_line(line_no + 1),
                );
            }
        }

        if opens_loop {
            loop_stack.push(depth);
        }
        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        while let Some(entry) = loop_stack.last() {
            if depth <= *entry {
                loop_stack.pop();
            } else {
                break;
            }
        }
    }

    // Unreleased timers.
    let created = count_matches(&artifact.code, r"\bset_(timeout|interval)\s*\(");
    let intervals = count_matches(&artifact.code, r"\bset_interval\s*\(");
    let cleared = count_matches(&artifact.code, r"\bclear_(timeout|interval)\s*\(");
    if created > cleared {
        let severity = if intervals > 0 {
            Severity::Medium
        } else {
            Severity::Low
        };
        findings.push(Finding::new(
            FindingKind::UnreleasedTimer,
            severity,
            format!("{created} timers created but only {cleared} cleared"),
        ));
    }

    let complexity = estimate_complexity(&artifact.code);
    if complexity != ComplexityLevel::Low {
        findings.push(Finding::new(
            FindingKind::ComplexityEstimate,
            Severity::Info,
            format!("estimated cyclomatic complexity is {complexity:?}"),
        ));
    }

    findings
}

fn count_matches(code: &str, pattern: &str) -> usize {
    Regex::new(pattern)
        .map(|re| re.find_iter(code).count())
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Complexity
// ═══════════════════════════════════════════════════════════════════════════════

/// Cyclomatic-complexity estimate from branching constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
}

impl ComplexityLevel {
    /// Score penalty for the overall report.
    pub const fn penalty(&self) -> u32 {
        match self {
            Self::Low => 0,
            Self::Medium => 5,
            Self::High => 15,
        }
    }
}

/// Count branching constructs: each branch point adds one to a base of one.
pub fn estimate_complexity(code: &str) -> ComplexityLevel {
    static BRANCHES: OnceLock<Regex> = OnceLock::new();
    let branches = BRANCHES
        .get_or_init(|| Regex::new(r"\b(if|while|for|loop|switch)\b|=>|&&|\|\|").unwrap());
    let count = 1 + branches.find_iter(code).count();
    if count <= 10 {
        ComplexityLevel::Low
    } else if count <= 20 {
        ComplexityLevel::Medium
    } else {
        ComplexityLevel::High
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;

    fn artifact_with(code: &str, manifest_json: &str) -> PluginArtifact {
        PluginArtifact::new(PluginManifest::from_json(manifest_json).unwrap(), code)
    }

    fn artifact(code: &str) -> PluginArtifact {
        artifact_with(code, r#"{"id": "t", "version": "1.0.0"}"#)
    }

    #[test]
    fn test_syntax_pass_reports_line() {
        let findings = ValidationPass::Syntax.apply(&artifact("fn init() {\nlet x = ;\n}"));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, FindingKind::SyntaxError);
        assert!(findings[0].location.is_some());
    }

    #[test]
    fn test_syntax_pass_accepts_valid_code() {
        let findings =
            ValidationPass::Syntax.apply(&artifact("fn init() { let x = 1 + 2; }"));
        assert!(findings.is_empty());
    }

    #[test]
    fn test_structure_pass_required_vs_recommended() {
        let findings = ValidationPass::Structure.apply(&artifact("fn init() { }"));
        // metadata missing (medium), destroy missing (low).
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::MissingEntryPoint && f.severity == Severity::Medium));
        assert!(findings.iter().any(|f| {
            f.kind == FindingKind::MissingRecommendedEntryPoint && f.severity == Severity::Low
        }));
    }

    #[test]
    fn test_structure_pass_checks_advertised_functions() {
        let a = artifact_with(
            "fn init() { }\nfn metadata() { }\nfn destroy() { }",
            r#"{"id": "t", "version": "1.0.0", "functions": [{"name": "missing_fn"}]}"#,
        );
        let findings = ValidationPass::Structure.apply(&a);
        assert!(findings
            .iter()
            .any(|f| f.message.contains("missing_fn")));
    }

    #[test]
    fn test_security_rules_fire_with_locations() {
        let code = "fn init() {\n  let r = http_get(\"https://x.test\");\n  write_file(\"/tmp/a\", r);\n}";
        let findings = ValidationPass::Security.apply(&artifact(code));
        let network = findings
            .iter()
            .find(|f| f.kind == FindingKind::OutboundNetworkCall)
            .unwrap();
        assert_eq!(network.severity, Severity::Low);
        assert_eq!(network.location.unwrap().line, 2);
        let fs = findings
            .iter()
            .find(|f| f.kind == FindingKind::FilesystemAccess)
            .unwrap();
        assert_eq!(fs.severity, Severity::Medium);
        assert_eq!(fs.location.unwrap().line, 3);
    }

    #[test]
    fn test_permission_drift_undeclared_use() {
        let code = "fn init() { http_get(\"https://x.test\"); }";
        let findings = ValidationPass::Security.apply(&artifact(code));
        assert!(findings.iter().any(|f| {
            f.kind == FindingKind::UndeclaredPermissionUse && f.severity == Severity::Medium
        }));
    }

    #[test]
    fn test_permission_drift_declared_unused() {
        let a = artifact_with(
            "fn init() { }",
            r#"{"id": "t", "version": "1.0.0", "permissions": ["network-access"]}"#,
        );
        let findings = ValidationPass::Security.apply(&a);
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::UnusedPermission && f.severity == Severity::Info));
    }

    #[test]
    fn test_no_drift_when_declared_and_used() {
        let a = artifact_with(
            "fn init() { http_get(\"https://x.test\"); }",
            r#"{"id": "t", "version": "1.0.0", "permissions": ["network-access"]}"#,
        );
        let findings = ValidationPass::Security.apply(&a);
        assert!(!findings
            .iter()
            .any(|f| matches!(
                f.kind,
                FindingKind::UndeclaredPermissionUse | FindingKind::UnusedPermission
            )));
    }

    #[test]
    fn test_string_timer_callback() {
        let code = "fn init() { set_timeout(\"do_work()\", 100); }";
        let findings = ValidationPass::Security.apply(&artifact(code));
        assert!(findings
            .iter()
            .any(|f| f.kind == FindingKind::StringTimerCallback));
    }

    #[test]
    fn test_performance_sleep_in_loop() {
        let code = "fn init() {\n  for i in 0..10 {\n    sleep(100);\n  }\n}";
        let findings = ValidationPass::Performance.apply(&artifact(code));
        let hazard = findings
            .iter()
            .find(|f| f.kind == FindingKind::BlockingCallInLoop)
            .unwrap();
        assert_eq!(hazard.location.unwrap().line, 3);
    }

    #[test]
    fn test_performance_query_in_loop() {
        let code = "fn scan() {\n  for r in regions {\n    let s = data_sequence(r);\n  }\n}";
        let findings = ValidationPass::Performance.apply(&artifact(code));
        assert!(findings.iter().any(|f| f.kind == FindingKind::QueryInLoop));
    }

    #[test]
    fn test_sleep_outside_loop_not_flagged() {
        let code = "fn init() {\n  sleep(100);\n}";
        let findings = ValidationPass::Performance.apply(&artifact(code));
        assert!(!findings
            .iter()
            .any(|f| f.kind == FindingKind::BlockingCallInLoop));
    }

    #[test]
    fn test_unreleased_timers() {
        let code = "fn init() {\n  let t = set_interval(|| tick(), 50);\n}";
        let findings = ValidationPass::Performance.apply(&artifact(code));
        let timer = findings
            .iter()
            .find(|f| f.kind == FindingKind::UnreleasedTimer)
            .unwrap();
        assert_eq!(timer.severity, Severity::Medium);
    }

    #[test]
    fn test_cleared_timers_not_flagged() {
        let code = "fn init() { let t = set_timeout(|| go(), 10); clear_timeout(t); }";
        let findings = ValidationPass::Performance.apply(&artifact(code));
        assert!(!findings
            .iter()
            .any(|f| f.kind == FindingKind::UnreleasedTimer));
    }

    #[test]
    fn test_complexity_levels() {
        assert_eq!(estimate_complexity("fn f() { 1 }"), ComplexityLevel::Low);

        let medium = "fn f() { ".to_string() + "if a { } ".repeat(12).as_str() + "}";
        assert_eq!(estimate_complexity(&medium), ComplexityLevel::Medium);

        let high = "fn f() { ".to_string() + "if a { } ".repeat(25).as_str() + "}";
        assert_eq!(estimate_complexity(&high), ComplexityLevel::High);
    }
}
