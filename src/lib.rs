#![allow(clippy::result_large_err)]
//! # Nucleus Core
//!
//! Plugin lifecycle core for the Nucleus genome-analysis workbench.
//!
//! ## Architecture
//!
//! - **Version Algebra**: Dotted numeric versions and constraint matching
//! - **Repository Port**: Abstract, cancellable lookup of plugins and versions
//! - **Dependency Resolver**: Tree walk, cycle detection, version
//!   reconciliation, and topologically ordered install plans
//! - **Validator Pipeline**: Pure syntax, structure, security, and
//!   performance passes with a scored report and advisory auto-fix
//! - **Sandbox Harness**: Capability-gated script evaluation against a
//!   deterministic mock host API
//! - **Plugin Registry**: Authoritative map of installed plugins with a
//!   per-entry state machine and atomic upgrades
//! - **Bootstrap Supervisor**: Ordered initialization and the host-facing
//!   install / uninstall / upgrade / call API
//! - **Event Bus**: Bounded topic-keyed diagnostics for UI collaborators

pub mod bus;
pub mod config;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod repository;
pub mod resolver;
pub mod sandbox;
pub mod supervisor;
pub mod telemetry;
pub mod validator;
pub mod version;

pub use error::{CoreError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{BusEvent, EventBus, Subscription, Topic};
    pub use crate::config::CoreConfig;
    pub use crate::error::{CoreError, ErrorCode, ErrorSeverity, Result};
    pub use crate::manifest::{
        DependencySpec, FunctionSpec, Permission, PluginArtifact, PluginManifest, PluginRef,
        VisualizationSpec,
    };
    pub use crate::registry::{EntryState, PluginRegistry, RegistryEntry, RegistrySnapshot};
    pub use crate::repository::{InMemoryRepository, PluginRepository};
    pub use crate::resolver::{DependencyResolver, InstallPlan, PlanEntry, ResolutionStats};
    pub use crate::sandbox::{
        aggregate_score, EntryPointOutcome, PluginHandle, SandboxHarness, SandboxPolicy,
        SandboxSession,
    };
    pub use crate::supervisor::{InstallResult, LifecycleSupervisor};
    pub use crate::validator::{
        autofix, AppliedFix, ComplexityLevel, Finding, FindingKind, Severity, ValidationReport,
        ValidatorPipeline,
    };
    pub use crate::version::{Version, VersionConstraint};
}
