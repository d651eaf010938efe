//! Validator pipeline: syntax, structure, security, and performance passes.
//!
//! Each pass is pure with respect to the artifact: passes inspect the code
//! and manifest but never execute plugin logic. Pass outputs compose into a
//! single [`ValidationReport`] with a floored, capped score. A `high`
//! security finding marks the report unsafe; install policy decides whether
//! that aborts the install.

mod autofix;
mod passes;

pub use autofix::{autofix, AppliedFix};
pub use passes::{ComplexityLevel, ValidationPass};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::manifest::PluginArtifact;

// ═══════════════════════════════════════════════════════════════════════════════
// Findings
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity of a single finding. Maps into the report score as a penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Score penalty for one finding of this severity.
    pub const fn penalty(&self) -> u32 {
        match self {
            Self::Info => 0,
            Self::Low => 5,
            Self::Medium => 10,
            Self::High => 20,
        }
    }
}

/// What a finding is about. Each kind belongs to exactly one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    // Syntax pass
    SyntaxError,
    // Structure pass
    MissingEntryPoint,
    MissingRecommendedEntryPoint,
    // Security pass
    DynamicCodeEvaluation,
    UnescapedHtmlSink,
    OutboundNetworkCall,
    FilesystemAccess,
    StringTimerCallback,
    UndeclaredPermissionUse,
    UnusedPermission,
    // Performance pass
    BlockingCallInLoop,
    QueryInLoop,
    UnreleasedTimer,
    ComplexityEstimate,
}

impl FindingKind {
    /// The pass that produces this kind of finding.
    pub const fn pass(&self) -> &'static str {
        match self {
            Self::SyntaxError => "syntax",
            Self::MissingEntryPoint | Self::MissingRecommendedEntryPoint => "structure",
            Self::DynamicCodeEvaluation
            | Self::UnescapedHtmlSink
            | Self::OutboundNetworkCall
            | Self::FilesystemAccess
            | Self::StringTimerCallback
            | Self::UndeclaredPermissionUse
            | Self::UnusedPermission => "security",
            Self::BlockingCallInLoop
            | Self::QueryInLoop
            | Self::UnreleasedTimer
            | Self::ComplexityEstimate => "performance",
        }
    }
}

/// Location of a finding within the plugin code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line number.
    pub line: usize,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Finding {
    pub fn new(kind: FindingKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            location: None,
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.location = Some(Location { line });
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validation Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-severity finding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub info: usize,
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

/// Aggregated output of the validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Findings in pass order.
    pub findings: Vec<Finding>,
    pub summary: SeverityCounts,
    /// Overall score in `[0, 100]`: 100 minus penalties, floored at 0.
    pub score: u8,
    /// True iff there is no high-severity security finding.
    pub safe: bool,
    /// True iff the syntax pass produced no findings.
    pub valid: bool,
    /// Complexity estimate from the performance pass.
    pub complexity: ComplexityLevel,
    /// Sub-score over security findings only; used by the sandbox harness
    /// for overall score aggregation.
    pub security_score: u8,
    /// Sub-score over performance findings and complexity.
    pub performance_score: u8,
}

impl ValidationReport {
    fn from_findings(findings: Vec<Finding>, complexity: ComplexityLevel) -> Self {
        let mut summary = SeverityCounts::default();
        let mut total_penalty = 0u32;
        let mut security_penalty = 0u32;
        let mut performance_penalty = complexity.penalty();
        let mut safe = true;
        let mut valid = true;

        for finding in &findings {
            match finding.severity {
                Severity::Info => summary.info += 1,
                Severity::Low => summary.low += 1,
                Severity::Medium => summary.medium += 1,
                Severity::High => summary.high += 1,
            }
            total_penalty += finding.severity.penalty();

            match finding.kind.pass() {
                "security" => {
                    security_penalty += finding.severity.penalty();
                    if finding.severity == Severity::High {
                        safe = false;
                    }
                }
                "performance" => performance_penalty += finding.severity.penalty(),
                "syntax" => valid = false,
                _ => {}
            }
        }

        total_penalty += complexity.penalty();

        Self {
            findings,
            summary,
            score: 100u32.saturating_sub(total_penalty) as u8,
            safe,
            valid,
            complexity,
            security_score: 100u32.saturating_sub(security_penalty) as u8,
            performance_score: 100u32.saturating_sub(performance_penalty) as u8,
        }
    }

    /// Findings at or above a severity.
    pub fn findings_at_least(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity >= severity)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════════

/// The ordered composition of validation passes.
#[derive(Debug, Clone)]
pub struct ValidatorPipeline {
    passes: Vec<ValidationPass>,
}

impl Default for ValidatorPipeline {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ValidatorPipeline {
    /// Build the standard pipeline. The security pass can be disabled by
    /// configuration; syntax, structure, and performance always run.
    pub fn new(enable_security: bool) -> Self {
        let mut passes = vec![ValidationPass::Syntax, ValidationPass::Structure];
        if enable_security {
            passes.push(ValidationPass::Security);
        }
        passes.push(ValidationPass::Performance);
        Self { passes }
    }

    /// Run every pass over the artifact and compose the report.
    pub fn validate(&self, artifact: &PluginArtifact) -> ValidationReport {
        let mut findings = Vec::new();
        for pass in &self.passes {
            let pass_findings = pass.apply(artifact);
            debug!(
                plugin = %artifact.manifest.id,
                pass = pass.name(),
                findings = pass_findings.len(),
                "Validation pass complete"
            );
            findings.extend(pass_findings);
        }

        let complexity = passes::estimate_complexity(&artifact.code);
        let report = ValidationReport::from_findings(findings, complexity);

        debug!(
            plugin = %artifact.manifest.id,
            score = report.score,
            safe = report.safe,
            valid = report.valid,
            "Validation complete"
        );
        report
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;

    fn artifact(code: &str) -> PluginArtifact {
        let manifest =
            PluginManifest::from_json(r#"{"id": "test-plugin", "version": "1.0.0"}"#).unwrap();
        PluginArtifact::new(manifest, code)
    }

    #[test]
    fn test_clean_plugin_scores_full() {
        let report = ValidatorPipeline::default().validate(&artifact(
            "fn init() { }\nfn metadata() { #{ id: \"test-plugin\" } }\nfn destroy() { }",
        ));
        assert_eq!(report.score, 100);
        assert!(report.safe);
        assert!(report.valid);
    }

    #[test]
    fn test_score_floors_at_zero() {
        // Six high findings would push the score far below zero.
        let code = "fn init() { }\nfn metadata() { }\nfn destroy() { }\n"
            .to_string()
            + "let x = eval(\"1\");\n".repeat(6).as_str();
        let report = ValidatorPipeline::default().validate(&artifact(&code));
        assert_eq!(report.score, 0);
        assert!(!report.safe);
    }

    #[test]
    fn test_safe_iff_no_high_security_finding() {
        let clean = ValidatorPipeline::default()
            .validate(&artifact("fn init() { }\nfn metadata() { }\nfn destroy() { }"));
        assert!(clean.safe);

        let unsafe_report = ValidatorPipeline::default().validate(&artifact(
            "fn init() { eval(\"print(1)\"); }\nfn metadata() { }\nfn destroy() { }",
        ));
        assert!(!unsafe_report.safe);
        assert!(unsafe_report
            .findings
            .iter()
            .any(|f| f.kind == FindingKind::DynamicCodeEvaluation
                && f.severity == Severity::High));
    }

    #[test]
    fn test_disabled_security_pass_skips_rules() {
        let pipeline = ValidatorPipeline::new(false);
        let report =
            pipeline.validate(&artifact("fn init() { eval(\"1\"); }\nfn metadata() { }\nfn destroy() { }"));
        assert!(report.safe);
        assert!(!report
            .findings
            .iter()
            .any(|f| f.kind == FindingKind::DynamicCodeEvaluation));
    }

    #[test]
    fn test_passes_are_pure() {
        let a = artifact("fn init() { }\nfn metadata() { }\nfn destroy() { }");
        let before = a.clone();
        let _ = ValidatorPipeline::default().validate(&a);
        assert_eq!(a, before);
    }
}
