//! Plugin registry: the authoritative map of installed plugins.
//!
//! Holds at most one entry per plugin id, drives the per-entry state
//! machine, and keeps enumeration stable: insertion order among ids,
//! declared order within an id. Upgrades stage the incoming version under a
//! separate key and swap it in under a single write lock, so observers see
//! exactly one of the two versions at any time. Sandbox sessions are
//! retained in a bounded ring buffer for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::manifest::{FunctionSpec, PluginArtifact, PluginRef, VisualizationSpec};
use crate::sandbox::{PluginHandle, SandboxSession};
use crate::version::Version;

// ═══════════════════════════════════════════════════════════════════════════════
// Entry State
// ═══════════════════════════════════════════════════════════════════════════════

/// State machine of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Admitted, not yet validated.
    Pending,
    /// Validator pipeline running.
    Validating,
    /// Sandbox harness running.
    Sandboxing,
    /// Live and callable.
    Active,
    /// A staged replacement is being swapped in.
    Upgrading,
    /// Teardown in progress.
    Stopping,
    /// A stage failed; retained for diagnostics, not exposed to callers.
    Quarantined,
    /// Gone. Terminal.
    Removed,
}

impl EntryState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Sandboxing => "sandboxing",
            Self::Active => "active",
            Self::Upgrading => "upgrading",
            Self::Stopping => "stopping",
            Self::Quarantined => "quarantined",
            Self::Removed => "removed",
        }
    }

    /// Whether the state machine permits `self -> to`.
    pub fn can_transition_to(&self, to: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, to),
            (Pending, Validating)
                | (Validating, Sandboxing)
                | (Sandboxing, Active)
                | (Pending, Quarantined)
                | (Validating, Quarantined)
                | (Sandboxing, Quarantined)
                | (Active, Stopping)
                | (Active, Upgrading)
                | (Upgrading, Active)
                | (Stopping, Removed)
                | (Quarantined, Removed)
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A plugin registered with the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// The plugin's manifest and code. Immutable; upgrades replace the whole
    /// entry.
    pub artifact: PluginArtifact,
    /// Compiled form live calls execute. Attached at activation; not
    /// serialized, so a deserialized entry is recompiled on first use.
    #[serde(skip)]
    pub handle: Option<PluginHandle>,
    pub state: EntryState,
    /// When the entry was admitted.
    pub registered_at: DateTime<Utc>,
    /// Last time the entry changed state or answered a health probe.
    pub last_health: DateTime<Utc>,
    /// Sandbox session that admitted this entry, once sandboxing passed.
    pub session_id: Option<Uuid>,
}

impl RegistryEntry {
    pub fn reference(&self) -> PluginRef {
        self.artifact.reference()
    }
}

/// Read-only view of an entry handed to UI collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub reference: PluginRef,
    pub state: EntryState,
    pub functions: Vec<String>,
    pub visualizations: Vec<String>,
    pub last_health: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Plugin Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Central registry. Thread-safe via interior `RwLock`; all mutation happens
/// under a single write lock so snapshots are always consistent.
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Debug)]
struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    /// Insertion order of live ids; staging keys never appear here.
    order: Vec<String>,
    sessions: VecDeque<SandboxSession>,
    session_capacity: usize,
}

/// Ids are lowercase alphanumerics and hyphens, so a colon cannot collide.
fn staging_key(id: &str) -> String {
    format!("{id}:staging")
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new(32)
    }
}

impl PluginRegistry {
    /// `session_capacity` bounds the diagnostic session ring buffer.
    pub fn new(session_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                entries: HashMap::new(),
                order: Vec::new(),
                sessions: VecDeque::new(),
                session_capacity: session_capacity.max(1),
            })),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission and state
    // ─────────────────────────────────────────────────────────────────────────

    /// Admit a new plugin in `pending` state. Fails with `RegistryConflict`
    /// when the id is already present.
    pub async fn admit(&self, artifact: PluginArtifact) -> Result<()> {
        let id = artifact.manifest.id.clone();
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(&id) {
            return Err(CoreError::RegistryConflict(format!(
                "plugin '{id}' is already registered"
            )));
        }
        let now = Utc::now();
        inner.entries.insert(
            id.clone(),
            RegistryEntry {
                artifact,
                handle: None,
                state: EntryState::Pending,
                registered_at: now,
                last_health: now,
                session_id: None,
            },
        );
        inner.order.push(id.clone());
        info!(plugin = %id, "Plugin admitted");
        Ok(())
    }

    /// Transition an entry, enforcing the state machine. Returns the previous
    /// state.
    pub async fn transition(&self, id: &str, to: EntryState) -> Result<EntryState> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?;

        let from = entry.state;
        if !from.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        entry.state = to;
        entry.last_health = Utc::now();
        info!(plugin = %id, from = %from, to = %to, "Plugin state changed");
        Ok(from)
    }

    /// Attach the sandbox session that admitted an entry.
    pub async fn attach_session(&self, id: &str, session_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?;
        entry.session_id = Some(session_id);
        Ok(())
    }

    /// Attach the compiled handle live calls execute.
    pub async fn attach_handle(&self, id: &str, handle: PluginHandle) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?;
        entry.handle = Some(handle);
        Ok(())
    }

    /// Drop an entry entirely. The entry must already be in a terminal-bound
    /// state (`stopping` or `quarantined`).
    pub async fn remove(&self, id: &str) -> Result<RegistryEntry> {
        let mut inner = self.inner.write().await;
        let state = inner
            .entries
            .get(id)
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?
            .state;
        if !state.can_transition_to(EntryState::Removed) {
            return Err(CoreError::InvalidStateTransition {
                id: id.to_string(),
                from: state.to_string(),
                to: EntryState::Removed.to_string(),
            });
        }
        let mut entry = inner.entries.remove(id).expect("entry present");
        entry.state = EntryState::Removed;
        inner.order.retain(|existing| existing != id);
        info!(plugin = %id, "Plugin removed");
        Ok(entry)
    }

    /// Clear a quarantined entry after the operator has inspected it.
    pub async fn clear_quarantine(&self, id: &str) -> Result<RegistryEntry> {
        {
            let inner = self.inner.read().await;
            let entry = inner
                .entries
                .get(id)
                .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?;
            if entry.state != EntryState::Quarantined {
                return Err(CoreError::InvalidStateTransition {
                    id: id.to_string(),
                    from: entry.state.to_string(),
                    to: EntryState::Removed.to_string(),
                });
            }
        }
        self.remove(id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Atomic upgrade
    // ─────────────────────────────────────────────────────────────────────────

    /// Stage a replacement version without touching the live entry.
    pub async fn stage_upgrade(&self, artifact: PluginArtifact) -> Result<String> {
        let id = artifact.manifest.id.clone();
        let key = staging_key(&id);
        let mut inner = self.inner.write().await;

        match inner.entries.get(&id).map(|e| e.state) {
            Some(EntryState::Active) => {}
            Some(state) => {
                return Err(CoreError::RegistryConflict(format!(
                    "cannot upgrade plugin '{id}' in state '{state}'"
                )))
            }
            None => return Err(CoreError::PluginNotRegistered(id)),
        }
        if inner.entries.contains_key(&key) {
            return Err(CoreError::RegistryConflict(format!(
                "an upgrade of '{id}' is already staged"
            )));
        }

        let now = Utc::now();
        inner.entries.insert(
            key.clone(),
            RegistryEntry {
                artifact,
                handle: None,
                state: EntryState::Pending,
                registered_at: now,
                last_health: now,
                session_id: None,
            },
        );
        Ok(key)
    }

    /// Transition a staged entry directly (it lives under the staging key).
    pub async fn transition_staged(&self, staging: &str, to: EntryState) -> Result<EntryState> {
        self.transition(staging, to).await
    }

    /// Swap the staged version in for the live one under a single write
    /// lock. Returns `(old, new)` references; any observer sees exactly one
    /// of the two versions.
    pub async fn promote(&self, id: &str) -> Result<(PluginRef, PluginRef)> {
        let key = staging_key(id);
        let mut inner = self.inner.write().await;

        let staged_state = inner
            .entries
            .get(&key)
            .ok_or_else(|| {
                CoreError::RegistryConflict(format!("no staged upgrade for plugin '{id}'"))
            })?
            .state;
        // The staged entry must have passed sandboxing.
        if staged_state != EntryState::Sandboxing && staged_state != EntryState::Active {
            return Err(CoreError::InvalidStateTransition {
                id: id.to_string(),
                from: staged_state.to_string(),
                to: EntryState::Active.to_string(),
            });
        }

        let old_state = inner
            .entries
            .get(id)
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?
            .state;
        if old_state != EntryState::Active && old_state != EntryState::Upgrading {
            return Err(CoreError::InvalidStateTransition {
                id: id.to_string(),
                from: old_state.to_string(),
                to: EntryState::Upgrading.to_string(),
            });
        }

        let mut staged = inner.entries.remove(&key).expect("staged entry");
        staged.state = EntryState::Active;
        staged.last_health = Utc::now();
        let new_reference = staged.reference();
        let old = inner.entries.insert(id.to_string(), staged).expect("live entry");
        // Insertion position in `order` is unchanged.
        info!(plugin = %id, from = %old.reference(), to = %new_reference, "Plugin upgraded");
        Ok((old.reference(), new_reference))
    }

    /// Abandon a staged upgrade; the live entry is untouched.
    pub async fn discard_staged(&self, id: &str) -> Result<RegistryEntry> {
        let key = staging_key(id);
        let mut inner = self.inner.write().await;
        inner
            .entries
            .remove(&key)
            .ok_or_else(|| CoreError::RegistryConflict(format!("no staged upgrade for plugin '{id}'")))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Views
    // ─────────────────────────────────────────────────────────────────────────

    /// Caller-facing snapshots in insertion order. Quarantined entries are
    /// retained for diagnostics but never listed here.
    pub async fn list(&self) -> Vec<RegistrySnapshot> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.state != EntryState::Quarantined)
            .map(|e| RegistrySnapshot {
                reference: e.reference(),
                state: e.state,
                functions: e
                    .artifact
                    .manifest
                    .functions
                    .iter()
                    .map(|f| f.name.clone())
                    .collect(),
                visualizations: e
                    .artifact
                    .manifest
                    .visualizations
                    .iter()
                    .map(|v| v.id.clone())
                    .collect(),
                last_health: e.last_health,
            })
            .collect()
    }

    /// Every entry including quarantined ones, for diagnostics.
    pub async fn list_all(&self) -> Vec<RegistryEntry> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .cloned()
            .collect()
    }

    /// A single entry, regardless of state.
    pub async fn get(&self, id: &str) -> Option<RegistryEntry> {
        self.inner.read().await.entries.get(id).cloned()
    }

    /// The entry of an `active` plugin, artifact and compiled handle
    /// included, for function invocation.
    pub async fn active_entry(&self, id: &str) -> Result<RegistryEntry> {
        let inner = self.inner.read().await;
        match inner.entries.get(id) {
            Some(entry) if entry.state == EntryState::Active => Ok(entry.clone()),
            _ => Err(CoreError::PluginNotRegistered(id.to_string())),
        }
    }

    /// Versions of currently `active` plugins, keyed by id. Feeds the
    /// resolver's already-installed marking.
    pub async fn installed_versions(&self) -> BTreeMap<String, Version> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.state == EntryState::Active)
            .map(|e| (e.artifact.manifest.id.clone(), e.artifact.manifest.version))
            .collect()
    }

    /// Advertised functions across active plugins: insertion order among
    /// ids, declared order within an id.
    pub async fn functions(&self) -> Vec<(String, FunctionSpec)> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.state == EntryState::Active)
            .flat_map(|e| {
                e.artifact
                    .manifest
                    .functions
                    .iter()
                    .map(|f| (e.artifact.manifest.id.clone(), f.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Advertised visualizations across active plugins, same ordering rules.
    pub async fn visualizations(&self) -> Vec<(String, VisualizationSpec)> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id))
            .filter(|e| e.state == EntryState::Active)
            .flat_map(|e| {
                e.artifact
                    .manifest
                    .visualizations
                    .iter()
                    .map(|v| (e.artifact.manifest.id.clone(), v.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Session history
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a sandbox session in the bounded ring buffer.
    pub async fn record_session(&self, session: SandboxSession) {
        let mut inner = self.inner.write().await;
        if inner.sessions.len() == inner.session_capacity {
            inner.sessions.pop_front();
        }
        inner.sessions.push_back(session);
    }

    /// Retained sessions, oldest first.
    pub async fn sessions(&self) -> Vec<SandboxSession> {
        self.inner.read().await.sessions.iter().cloned().collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;
    use std::time::Duration;

    fn artifact(id: &str, version: &str) -> PluginArtifact {
        let json = format!(
            r#"{{"id": "{id}", "version": "{version}",
                 "functions": [{{"name": "run"}}]}}"#
        );
        PluginArtifact::new(PluginManifest::from_json(&json).unwrap(), "fn init() { }")
    }

    async fn activate(registry: &PluginRegistry, id: &str) {
        registry.transition(id, EntryState::Validating).await.unwrap();
        registry.transition(id, EntryState::Sandboxing).await.unwrap();
        registry.transition(id, EntryState::Active).await.unwrap();
    }

    #[tokio::test]
    async fn test_admission_and_duplicate_conflict() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        let err = registry.admit(artifact("a", "2.0.0")).await.unwrap_err();
        assert!(matches!(err, CoreError::RegistryConflict(_)));
    }

    #[tokio::test]
    async fn test_happy_path_state_machine() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        activate(&registry, "a").await;
        assert_eq!(registry.get("a").await.unwrap().state, EntryState::Active);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        let err = registry
            .transition("a", EntryState::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        // The failed transition left the state untouched.
        assert_eq!(registry.get("a").await.unwrap().state, EntryState::Pending);
    }

    #[tokio::test]
    async fn test_quarantined_entries_hidden_from_list() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("bad", "1.0.0")).await.unwrap();
        registry
            .transition("bad", EntryState::Validating)
            .await
            .unwrap();
        registry
            .transition("bad", EntryState::Quarantined)
            .await
            .unwrap();

        assert!(registry.list().await.is_empty());
        // Still present for diagnostics.
        assert_eq!(registry.list_all().await.len(), 1);

        registry.clear_quarantine("bad").await.unwrap();
        assert!(registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_uninstall_path() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        activate(&registry, "a").await;

        registry.transition("a", EntryState::Stopping).await.unwrap();
        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.state, EntryState::Removed);
        assert!(registry.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_enumeration_order_is_stable() {
        let registry = PluginRegistry::default();
        for id in ["zeta", "alpha", "mid"] {
            registry.admit(artifact(id, "1.0.0")).await.unwrap();
            activate(&registry, id).await;
        }
        let ids: Vec<String> = registry
            .list()
            .await
            .iter()
            .map(|s| s.reference.id.clone())
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);

        let functions = registry.functions().await;
        assert_eq!(functions[0].0, "zeta");
        assert_eq!(functions[2].0, "mid");
    }

    #[tokio::test]
    async fn test_atomic_upgrade_swaps_versions() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        activate(&registry, "a").await;

        let key = registry.stage_upgrade(artifact("a", "1.2.0")).await.unwrap();
        registry
            .transition_staged(&key, EntryState::Validating)
            .await
            .unwrap();
        registry
            .transition_staged(&key, EntryState::Sandboxing)
            .await
            .unwrap();

        // Live lookups still see the old version while staged.
        assert_eq!(
            registry.get("a").await.unwrap().reference().version,
            Version::new(1, 0, 0)
        );

        let (old, new) = registry.promote("a").await.unwrap();
        assert_eq!(old.version, Version::new(1, 0, 0));
        assert_eq!(new.version, Version::new(1, 2, 0));

        let snapshots = registry.list().await;
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].reference.version, Version::new(1, 2, 0));
    }

    #[tokio::test]
    async fn test_discarded_staging_leaves_live_untouched() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        activate(&registry, "a").await;

        registry.stage_upgrade(artifact("a", "2.0.0")).await.unwrap();
        registry.discard_staged("a").await.unwrap();

        assert_eq!(
            registry.get("a").await.unwrap().reference().version,
            Version::new(1, 0, 0)
        );
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upgrade_requires_active_entry() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        let err = registry
            .stage_upgrade(artifact("a", "2.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RegistryConflict(_)));
    }

    #[tokio::test]
    async fn test_active_entry_carries_attached_handle() {
        let registry = PluginRegistry::default();
        let a = artifact("a", "1.0.0");
        registry.admit(a.clone()).await.unwrap();
        activate(&registry, "a").await;

        let handle = crate::sandbox::SandboxHarness::default().load(&a).unwrap();
        registry.attach_handle("a", handle).await.unwrap();

        let entry = registry.active_entry("a").await.unwrap();
        assert!(entry.handle.is_some());
    }

    #[tokio::test]
    async fn test_promote_carries_staged_handle() {
        let registry = PluginRegistry::default();
        registry.admit(artifact("a", "1.0.0")).await.unwrap();
        activate(&registry, "a").await;

        let staged = artifact("a", "1.2.0");
        let key = registry.stage_upgrade(staged.clone()).await.unwrap();
        registry
            .transition_staged(&key, EntryState::Validating)
            .await
            .unwrap();
        registry
            .transition_staged(&key, EntryState::Sandboxing)
            .await
            .unwrap();
        let handle = crate::sandbox::SandboxHarness::default()
            .load(&staged)
            .unwrap();
        registry.attach_handle(&key, handle).await.unwrap();

        registry.promote("a").await.unwrap();
        let entry = registry.active_entry("a").await.unwrap();
        assert_eq!(entry.reference().version, Version::new(1, 2, 0));
        assert!(entry.handle.is_some());
    }

    #[tokio::test]
    async fn test_session_ring_buffer_is_bounded() {
        let registry = PluginRegistry::new(2);
        for i in 0..4 {
            registry
                .record_session(SandboxSession {
                    id: Uuid::new_v4(),
                    plugin_id: format!("p{i}"),
                    started_at: Utc::now(),
                    outcomes: Vec::new(),
                    coverage: 1.0,
                    load_error: None,
                    leaked_timers: 0,
                    duration: Duration::ZERO,
                    passed: true,
                })
                .await;
        }
        let sessions = registry.sessions().await;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].plugin_id, "p2");
        assert_eq!(sessions[1].plugin_id, "p3");
    }
}
