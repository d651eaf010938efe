//! Advisory rewrites for mechanically fixable findings.
//!
//! Autofix never mutates the original artifact: callers get a rewritten copy
//! plus a record of what changed, and must re-validate the copy before
//! trusting it.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::manifest::PluginArtifact;

/// A single rewrite applied by [`autofix`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    /// Stable rule name, e.g. `string-timer-to-closure`.
    pub rule: &'static str,
    /// 1-based line of the rewritten occurrence.
    pub line: usize,
    pub description: String,
}

/// Rewrite fixable hazards in a copy of the artifact.
///
/// Two rules today: string timer bodies become closures, and the raw HTML
/// sink becomes the escaping one. Returns the rewritten copy and the list of
/// applied fixes; an empty list means the copy is byte-identical.
pub fn autofix(artifact: &PluginArtifact) -> (PluginArtifact, Vec<AppliedFix>) {
    static STRING_TIMER: OnceLock<Regex> = OnceLock::new();
    static RAW_HTML: OnceLock<Regex> = OnceLock::new();
    let string_timer = STRING_TIMER.get_or_init(|| {
        Regex::new(r#"\b(set_timeout|set_interval)\s*\(\s*"([^"]*)"\s*,"#).unwrap()
    });
    let raw_html = RAW_HTML.get_or_init(|| Regex::new(r"\bui_set_panel_raw_html\s*\(").unwrap());

    let mut fixes = Vec::new();
    let mut lines: Vec<String> = Vec::with_capacity(artifact.code.lines().count());

    for (line_no, line) in artifact.code.lines().enumerate() {
        let mut rewritten = line.to_string();

        if string_timer.is_match(&rewritten) {
            rewritten = string_timer
                .replace_all(&rewritten, |caps: &Captures| {
                    format!("{}(|| {},", &caps[1], &caps[2])
                })
                .into_owned();
            fixes.push(AppliedFix {
                rule: "string-timer-to-closure",
                line: line_no + 1,
                description: "replaced string timer body with a closure".into(),
            });
        }

        if raw_html.is_match(&rewritten) {
            rewritten = raw_html
                .replace_all(&rewritten, "ui_set_panel_html(")
                .into_owned();
            fixes.push(AppliedFix {
                rule: "raw-html-to-escaped",
                line: line_no + 1,
                description: "routed panel content through the escaping HTML sink".into(),
            });
        }

        lines.push(rewritten);
    }

    if fixes.is_empty() {
        return (artifact.clone(), fixes);
    }

    let mut code = lines.join("\n");
    if artifact.code.ends_with('\n') {
        code.push('\n');
    }
    (
        PluginArtifact::new(artifact.manifest.clone(), code),
        fixes,
    )
}
