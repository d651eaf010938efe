//! Plugin manifest parsing and validation.
//!
//! Supports both TOML and JSON manifest formats. Every plugin declares its
//! identity, permissions, dependencies, and the functions and visualizations
//! it advertises. Manifests are immutable after ingestion; resolved versions
//! are tracked separately in the install plan.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::version::{Version, VersionConstraint};

// ═══════════════════════════════════════════════════════════════════════════════
// PluginRef
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a plugin at a specific version. Equality is componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PluginRef {
    pub id: String,
    pub version: Version,
}

impl PluginRef {
    pub fn new(id: impl Into<String>, version: Version) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl fmt::Display for PluginRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse capability tags a plugin declares. Cross-checked by the security
/// validation pass against the patterns observed in the plugin code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    /// Outbound network calls through the host API.
    NetworkAccess,
    /// Host-mediated file reads and writes.
    FileAccess,
    /// Panels, menus, and notifications.
    UiAccess,
    /// Registration of AI-callable functions.
    AiAccess,
}

impl Permission {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkAccess => "network-access",
            Self::FileAccess => "file-access",
            Self::UiAccess => "ui-access",
            Self::AiAccess => "ai-access",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Declared dependencies, functions, visualizations
// ═══════════════════════════════════════════════════════════════════════════════

/// A dependency on another plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// Id of the required plugin.
    pub id: String,
    /// Version constraint (e.g. `^1.0.0`).
    pub constraint: VersionConstraint,
}

/// A parameter of an advertised function. The sandbox synthesizes fixture
/// values from the parameter name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// Free-form type hint (e.g. "sequence", "region", "number[]").
    #[serde(default)]
    pub kind: String,
}

/// A function the plugin advertises to the host and to other plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    /// Stable function name; must exist as an entry point in the plugin code.
    pub name: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Declared purpose shown in the workbench UI.
    #[serde(default)]
    pub purpose: String,
}

/// A visualization the plugin advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualizationSpec {
    /// Stable visualization id.
    pub id: String,
    /// Category used for grouping in the workbench (e.g. "track", "panel").
    #[serde(default)]
    pub category: String,
    /// Icon hint for the UI.
    #[serde(default)]
    pub icon: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PluginManifest
// ═══════════════════════════════════════════════════════════════════════════════

/// Full manifest for a plugin, stored as `plugin.toml` or `plugin.json` in
/// the repository alongside the plugin code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Stable short id, unique in the repository.
    pub id: String,

    /// Version of this manifest's artifact.
    pub version: Version,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Human-readable description.
    #[serde(default)]
    pub description: String,

    /// Author name or organisation.
    #[serde(default)]
    pub author: String,

    /// Permissions the plugin requests.
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Dependencies on other plugins.
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    /// Functions the plugin advertises.
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,

    /// Visualizations the plugin advertises.
    #[serde(default)]
    pub visualizations: Vec<VisualizationSpec>,
}

impl PluginManifest {
    /// Parse a manifest from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ManifestError> {
        toml::from_str(toml_str).map_err(|e| ManifestError::ParseError {
            format: "TOML".into(),
            details: e.to_string(),
        })
    }

    /// Parse a manifest from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self, ManifestError> {
        serde_json::from_str(json_str).map_err(|e| ManifestError::ParseError {
            format: "JSON".into(),
            details: e.to_string(),
        })
    }

    /// The `(id, version)` reference for this manifest.
    pub fn reference(&self) -> PluginRef {
        PluginRef::new(self.id.clone(), self.version)
    }

    /// Check whether the manifest declares a permission.
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Validate the manifest fields.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::ValidationError("id must not be empty".into()));
        }

        // Naming convention: lowercase alphanumeric + hyphens.
        if !self
            .id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(ManifestError::ValidationError(
                "id must contain only lowercase alphanumeric characters and hyphens".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for func in &self.functions {
            if func.name.is_empty() {
                return Err(ManifestError::ValidationError(
                    "function names must not be empty".into(),
                ));
            }
            if !seen.insert(func.name.as_str()) {
                return Err(ManifestError::ValidationError(format!(
                    "duplicate function name '{}'",
                    func.name
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for vis in &self.visualizations {
            if !seen.insert(vis.id.as_str()) {
                return Err(ManifestError::ValidationError(format!(
                    "duplicate visualization id '{}'",
                    vis.id
                )));
            }
        }

        for dep in &self.dependencies {
            if dep.id == self.id {
                return Err(ManifestError::ValidationError(format!(
                    "plugin '{}' cannot depend on itself",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PluginArtifact
// ═══════════════════════════════════════════════════════════════════════════════

/// A plugin's loadable code plus its manifest. Never mutated by the core;
/// auto-fix produces a fresh artifact instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginArtifact {
    pub manifest: PluginManifest,
    /// Script source evaluated by the sandbox.
    pub code: String,
}

impl PluginArtifact {
    pub fn new(manifest: PluginManifest, code: impl Into<String>) -> Self {
        Self {
            manifest,
            code: code.into(),
        }
    }

    pub fn reference(&self) -> PluginRef {
        self.manifest.reference()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Errors that can occur when working with plugin manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Failed to parse {format} manifest: {details}")]
    ParseError { format: String, details: String },

    #[error("Manifest validation error: {0}")]
    ValidationError(String),
}

impl From<ManifestError> for crate::error::CoreError {
    fn from(e: ManifestError) -> Self {
        crate::error::CoreError::MalformedManifest(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_manifest() {
        let toml = r#"
id = "codon-usage"
version = "1.0.0"
name = "Codon Usage"
description = "Codon usage bias analysis"
author = "Nucleus Team"
permissions = ["ui-access"]

[[dependencies]]
id = "sequence-utils"
constraint = "^1.0.0"

[[functions]]
name = "analyze_codons"
purpose = "Compute codon usage frequencies"

[[functions.params]]
name = "sequence"
kind = "sequence"

[[visualizations]]
id = "codon-heatmap"
category = "panel"
icon = "grid"
"#;
        let manifest = PluginManifest::from_toml(toml).unwrap();
        assert_eq!(manifest.id, "codon-usage");
        assert_eq!(manifest.version, Version::new(1, 0, 0));
        assert_eq!(manifest.dependencies.len(), 1);
        assert_eq!(
            manifest.dependencies[0].constraint,
            VersionConstraint::Caret(Version::new(1, 0, 0))
        );
        assert_eq!(manifest.functions[0].params[0].name, "sequence");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{
            "id": "gc-content",
            "version": "0.2.0",
            "functions": [{"name": "gc_percent"}]
        }"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert_eq!(manifest.id, "gc-content");
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_id() {
        let json = r#"{"id": "Bad Name", "version": "1.0.0"}"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let json = r#"{
            "id": "loop",
            "version": "1.0.0",
            "dependencies": [{"id": "loop", "constraint": "*"}]
        }"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_functions() {
        let json = r#"{
            "id": "dup",
            "version": "1.0.0",
            "functions": [{"name": "f"}, {"name": "f"}]
        }"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_prerelease_version_rejected_in_manifest() {
        let json = r#"{"id": "pre", "version": "1.0.0-beta"}"#;
        assert!(PluginManifest::from_json(json).is_err());
    }
}
