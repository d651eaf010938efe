//! Dependency resolution over the plugin repository.
//!
//! This module handles:
//! - Dependency tree construction with version pinning per edge
//! - Cycle detection with diagnostic paths
//! - Version conflict reconciliation across constraint sets
//! - Topological install ordering (dependencies before dependents)

mod graph;
mod plan;

pub use graph::DependencyGraph;
pub use plan::{InstallPlan, PlanEntry, ResolutionStats};

use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::manifest::{PluginManifest, PluginRef};
use crate::repository::PluginRepository;
use crate::version::{Version, VersionConstraint};

/// One observation of an id during the tree walk: the constraint an edge
/// imposed and the version pinned for that edge.
#[derive(Debug, Clone)]
struct Occurrence {
    constraint: VersionConstraint,
    pinned: Version,
}

/// Resolves a set of root manifests into an [`InstallPlan`].
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    /// Recursion bound for the tree walk.
    max_depth: usize,
    /// When false, only advertised versions are considered (no
    /// `list_versions` fallback).
    use_marketplace_listings: bool,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self {
            max_depth: 10,
            use_marketplace_listings: true,
        }
    }
}

impl DependencyResolver {
    pub fn new(max_depth: usize, use_marketplace_listings: bool) -> Self {
        Self {
            max_depth,
            use_marketplace_listings,
        }
    }

    /// Resolve `roots` into an install plan.
    ///
    /// `installed` is a snapshot of the registry's active `(id, version)`
    /// pairs. A dependency already active at a version satisfying every
    /// constraint on it is kept at that version and marked
    /// `already_installed` so later phases skip it, even when newer
    /// satisfying versions are published.
    pub async fn resolve(
        &self,
        roots: &[PluginManifest],
        repository: &dyn PluginRepository,
        installed: &BTreeMap<String, Version>,
        token: &CancellationToken,
    ) -> Result<(InstallPlan, ResolutionStats)> {
        // Duplicate root declarations collapse to one entry.
        let mut root_ids: Vec<&str> = Vec::new();
        let mut unique_roots: Vec<&PluginManifest> = Vec::new();
        for root in roots {
            if !root_ids.contains(&root.id.as_str()) {
                root_ids.push(&root.id);
                unique_roots.push(root);
            }
        }

        let mut state = WalkState::default();

        // Roots pin their own manifest versions.
        for root in &unique_roots {
            state.graph.ensure_node(&root.id);
            state
                .occurrences
                .entry(root.id.clone())
                .or_default()
                .push(Occurrence {
                    constraint: VersionConstraint::Exact(root.version),
                    pinned: root.version,
                });
        }

        // 1. Tree construction: depth-first walk pinning a version per edge.
        for root in &unique_roots {
            self.walk(root, 1, repository, &mut state, token).await?;
        }

        // 2. Cycle detection.
        state.graph.check_cycles()?;

        // 3. Version reconciliation.
        let (mut resolved, warnings, conflicts) = reconcile(&state.occurrences)?;

        // A dependency already active at a version satisfying every
        // constraint on it is retained as-is; roots the caller named are
        // never silently skipped this way.
        let root_set: HashSet<&str> = root_ids.iter().copied().collect();
        for (id, seen) in &state.occurrences {
            if root_set.contains(id.as_str()) {
                continue;
            }
            if let Some(active) = installed.get(id) {
                if seen.iter().all(|o| o.constraint.satisfies(active)) {
                    resolved.insert(id.clone(), *active);
                }
            }
        }

        // 4. Topological order, dependencies first, lexicographic tie-break.
        let order = state.graph.topological_order()?;

        // 5. Plan validation: every edge constraint must hold against the
        //    reconciled versions.
        for (dependent, dependency, constraint) in state.graph.edges() {
            let version = resolved
                .get(&dependency)
                .ok_or_else(|| CoreError::internal(format!("unresolved id '{dependency}'")))?;
            if !constraint.satisfies(version) {
                return Err(CoreError::IncompatibleDependency {
                    id: dependency.clone(),
                    resolved: version.to_string(),
                    constraint: format!("{constraint} (required by '{dependent}')"),
                });
            }
        }

        let entries = order
            .into_iter()
            .map(|id| {
                let version = resolved[&id];
                let is_root = root_set.contains(id.as_str());
                let already_installed = !is_root && installed.get(&id) == Some(&version);
                PlanEntry {
                    reference: PluginRef::new(id.clone(), version),
                    is_root,
                    already_installed,
                }
            })
            .collect::<Vec<_>>();

        let stats = ResolutionStats {
            nodes: state.graph.node_count(),
            edges: state.graph.edge_count(),
            max_depth: state.max_depth_seen,
            conflicts,
            warnings: warnings.len(),
        };

        let plan = InstallPlan {
            entries,
            resolved,
            warnings,
        };

        info!(
            roots = roots.len(),
            nodes = stats.nodes,
            edges = stats.edges,
            conflicts = stats.conflicts,
            "Dependency resolution complete"
        );

        Ok((plan, stats))
    }

    /// Depth-first walk from `manifest`, recording edges and occurrences.
    fn walk<'a>(
        &'a self,
        manifest: &'a PluginManifest,
        depth: usize,
        repository: &'a dyn PluginRepository,
        state: &'a mut WalkState,
        token: &'a CancellationToken,
    ) -> BoxedWalk<'a> {
        Box::pin(async move {
            if depth > self.max_depth {
                return Err(CoreError::DependencyTreeTooDeep {
                    id: manifest.id.clone(),
                    limit: self.max_depth,
                });
            }
            state.max_depth_seen = state.max_depth_seen.max(depth);

            if !state.visited.insert(manifest.id.clone()) {
                return Ok(());
            }

            for dep in &manifest.dependencies {
                let advertised = repository
                    .find(&dep.id, token)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(dep.id.clone()))?;

                let pinned = if dep.constraint.satisfies(&advertised.version) {
                    advertised.version
                } else if self.use_marketplace_listings {
                    let versions = repository.list_versions(&dep.id, token).await?;
                    dep.constraint.best(&versions).ok_or_else(|| {
                        CoreError::IncompatibleDependency {
                            id: dep.id.clone(),
                            resolved: "no available version".into(),
                            constraint: dep.constraint.to_string(),
                        }
                    })?
                } else {
                    return Err(CoreError::IncompatibleDependency {
                        id: dep.id.clone(),
                        resolved: advertised.version.to_string(),
                        constraint: dep.constraint.to_string(),
                    });
                };

                debug!(
                    dependent = %manifest.id,
                    dependency = %dep.id,
                    constraint = %dep.constraint,
                    pinned = %pinned,
                    "Pinned dependency edge"
                );

                state
                    .graph
                    .add_dependency(&manifest.id, &dep.id, dep.constraint);
                state
                    .occurrences
                    .entry(dep.id.clone())
                    .or_default()
                    .push(Occurrence {
                        constraint: dep.constraint,
                        pinned,
                    });

                // Recurse using the advertised manifest's declared
                // dependencies. The repository port only exposes the
                // advertised manifest; per-version manifests arrive with the
                // fetched artifact later.
                self.walk(&advertised, depth + 1, repository, state, token)
                    .await?;
            }

            Ok(())
        })
    }
}

type BoxedWalk<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

#[derive(Default)]
struct WalkState {
    graph: DependencyGraph,
    occurrences: BTreeMap<String, Vec<Occurrence>>,
    visited: HashSet<String>,
    max_depth_seen: usize,
}

/// Reconcile all occurrences of each id into a single chosen version.
///
/// Returns `(resolved versions, warnings, conflict count)`.
fn reconcile(
    occurrences: &BTreeMap<String, Vec<Occurrence>>,
) -> Result<(BTreeMap<String, Version>, Vec<String>, usize)> {
    let mut resolved = BTreeMap::new();
    let mut warnings = Vec::new();
    let mut conflicts = 0usize;

    for (id, seen) in occurrences {
        if seen.len() == 1 {
            resolved.insert(id.clone(), seen[0].pinned);
            continue;
        }

        let distinct_pins: HashSet<Version> = seen.iter().map(|o| o.pinned).collect();
        if distinct_pins.len() > 1 {
            conflicts += 1;
        }

        // Candidates are the union of observed pins, highest first.
        let mut candidates: Vec<Version> = distinct_pins.into_iter().collect();
        candidates.sort();
        candidates.reverse();

        // Prefer the highest candidate satisfying every constraint.
        let full_match = candidates
            .iter()
            .find(|v| seen.iter().all(|o| o.constraint.satisfies(v)))
            .copied();

        let choice = match full_match {
            Some(v) => v,
            None => {
                // Best-effort: highest candidate satisfying the most
                // constraints; zero satisfied is unresolvable.
                let (best, satisfied) = candidates
                    .iter()
                    .map(|v| {
                        let count = seen.iter().filter(|o| o.constraint.satisfies(v)).count();
                        (*v, count)
                    })
                    .max_by_key(|(v, count)| (*count, *v))
                    .expect("at least one candidate");

                if satisfied == 0 {
                    let details = seen
                        .iter()
                        .map(|o| o.constraint.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Err(CoreError::UnresolvableConflict {
                        id: id.clone(),
                        details: format!("no version satisfies any of: {details}"),
                    });
                }

                let message = format!(
                    "conflict on '{id}': no version satisfies all {} constraints; \
                     picked {best} satisfying {satisfied}",
                    seen.len()
                );
                warn!(plugin = %id, "{message}");
                warnings.push(message);
                best
            }
        };

        resolved.insert(id.clone(), choice);
    }

    Ok((resolved, warnings, conflicts))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
