//! Core configuration.
//!
//! All supported options are enumerated here with documented effects; there
//! is no free-form configuration object. Defaults are production values.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::sandbox::SandboxPolicy;

/// Configuration for the plugin lifecycle core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Enforce the sandbox operation budget. When off, scripts run without
    /// an operation limit (the per-call deadline still applies).
    pub enable_resource_management: bool,

    /// Consult the repository's version listings during resolution. When
    /// off, only the version a manifest advertises can be installed.
    pub enable_marketplace: bool,

    /// Run the security validation pass. Turning this off skips the rule
    /// table and permission drift checks entirely.
    pub enable_security_validation: bool,

    /// Resolve and install dependencies. When off, the install plan
    /// degenerates to the requested root alone.
    pub enable_dependency_resolution: bool,

    /// Installing a newer version over an older active one upgrades in
    /// place instead of failing with a conflict.
    pub enable_auto_updates: bool,

    /// Cache fetched artifacts keyed by `(id, version)` so repeated installs
    /// skip the repository fetch.
    pub enable_caching: bool,

    /// Emit debug-level traffic on the diagnostic bus.
    pub verbose_diagnostics: bool,

    /// Accept plugins whose validation report is unsafe. Explicit operator
    /// override; never the default.
    pub allow_unsafe: bool,

    /// Maximum dependency tree depth before resolution fails.
    pub max_dependency_depth: usize,

    /// Attempts per artifact fetch; only transient repository failures are
    /// retried.
    pub fetch_retry_attempts: u32,

    /// Wall-clock budget per sandbox entry point call.
    #[serde(with = "humantime_serde")]
    pub entry_call_timeout: Duration,

    /// Outer deadline for one whole install request.
    #[serde(with = "humantime_serde")]
    pub install_deadline: Duration,

    /// Per-subscriber backlog bound on each bus topic.
    pub bus_capacity: usize,

    /// Sandbox sessions retained for diagnostics.
    pub session_history: usize,

    /// Script operation budget per sandbox run, when resource management is
    /// enabled.
    pub max_script_operations: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            enable_resource_management: true,
            enable_marketplace: true,
            enable_security_validation: true,
            enable_dependency_resolution: true,
            enable_auto_updates: false,
            enable_caching: true,
            verbose_diagnostics: false,
            allow_unsafe: false,
            max_dependency_depth: 10,
            fetch_retry_attempts: 2,
            entry_call_timeout: Duration::from_secs(2),
            install_deadline: Duration::from_secs(60),
            bus_capacity: 64,
            session_history: 32,
            max_script_operations: 500_000,
        }
    }
}

impl CoreConfig {
    /// Load from a TOML file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Internal(format!("config read failed: {e}")))?;
        toml::from_str(&text)
            .map_err(|e| CoreError::Internal(format!("config parse failed: {e}")))
    }

    /// The sandbox policy derived from this configuration.
    pub fn sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            entry_call_timeout: self.entry_call_timeout,
            max_operations: if self.enable_resource_management {
                self.max_script_operations
            } else {
                0
            },
            granted_permissions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_safe() {
        let config = CoreConfig::default();
        assert!(config.enable_security_validation);
        assert!(!config.allow_unsafe);
        assert_eq!(config.max_dependency_depth, 10);
        assert_eq!(config.fetch_retry_attempts, 2);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            enable_auto_updates = true
            entry_call_timeout = "500ms"
            "#,
        )
        .unwrap();
        assert!(config.enable_auto_updates);
        assert_eq!(config.entry_call_timeout, Duration::from_millis(500));
        assert!(config.enable_caching);
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nucleus.toml");
        std::fs::write(&path, "allow_unsafe = true\nbus_capacity = 8\n").unwrap();

        let config = CoreConfig::from_file(&path).unwrap();
        assert!(config.allow_unsafe);
        assert_eq!(config.bus_capacity, 8);

        assert!(CoreConfig::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_resource_management_gates_operation_budget() {
        let mut config = CoreConfig::default();
        assert_eq!(config.sandbox_policy().max_operations, 500_000);
        config.enable_resource_management = false;
        assert_eq!(config.sandbox_policy().max_operations, 0);
    }
}
