//! Install plan and resolution statistics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::manifest::PluginRef;
use crate::version::Version;

/// One step of an install plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// The plugin to install at its resolved version.
    pub reference: PluginRef,
    /// True when this entry was requested by the user, false for a
    /// transitive dependency.
    pub is_root: bool,
    /// True when the registry already holds this exact version; sandbox and
    /// registration are skipped for such entries.
    pub already_installed: bool,
}

/// An ordered sequence of plugins to install. The order is a linear
/// extension of the dependency DAG: every dependency precedes its
/// dependents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstallPlan {
    pub entries: Vec<PlanEntry>,
    /// The resolved-version map used to build the plan; one chosen version
    /// per id, kept separate from the (immutable) manifests.
    pub resolved: BTreeMap<String, Version>,
    /// Conflict-resolution warnings produced during reconciliation. These do
    /// not fail the plan but are surfaced on the diagnostic bus.
    pub warnings: Vec<String>,
}

impl InstallPlan {
    /// Position of an id in the plan, if present.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.reference.id == id)
    }

    /// Number of entries that actually need installation.
    pub fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.already_installed).count()
    }
}

/// Statistics about one resolution run, emitted on the `resolution` topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionStats {
    /// Number of distinct plugins in the dependency graph.
    pub nodes: usize,
    /// Number of dependency edges.
    pub edges: usize,
    /// Deepest point reached during the tree walk.
    pub max_depth: usize,
    /// Ids that appeared with more than one pinned version before
    /// reconciliation.
    pub conflicts: usize,
    /// Reconciliation warnings (best-effort version picks).
    pub warnings: usize,
}
