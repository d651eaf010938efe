//! Bootstrap supervisor: ordered initialization and the host-facing API.
//!
//! The supervisor owns every collaborator and wires them in a fixed order:
//! version algebra, repository port, dependency resolver, validator,
//! sandbox, registry. Install requests flow resolve, fetch, validate,
//! sandbox, register; the first failing plugin aborts the remainder of the
//! plan while already-activated predecessors stay in place. All diagnostics
//! go out on the bus; callers that want progress subscribe to it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusEvent, EventBus, Subscription, Topic};
use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::manifest::{PluginArtifact, PluginManifest, PluginRef};
use crate::registry::{EntryState, PluginRegistry, RegistrySnapshot};
use crate::repository::PluginRepository;
use crate::resolver::{DependencyResolver, InstallPlan, PlanEntry, ResolutionStats};
use crate::sandbox::{aggregate_score, SandboxHarness, SandboxSession};
use crate::validator::ValidatorPipeline;
use crate::version::{Version, VersionConstraint};

/// Initialization order; each module reports readiness on the lifecycle
/// topic.
const MODULE_ORDER: [&str; 6] = [
    "version-algebra",
    "repository",
    "resolver",
    "validator",
    "sandbox",
    "registry",
];

// ═══════════════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a successful install request.
#[derive(Debug, Clone)]
pub struct InstallResult {
    /// Plugins activated by this request, in plan order.
    pub installed: Vec<PluginRef>,
    /// Plan entries skipped because the exact version was already active.
    pub skipped: Vec<PluginRef>,
    /// Conflict-resolution warnings from the resolver.
    pub warnings: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Supervisor
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of the plugin lifecycle core. Hosts construct one, call
/// [`initialize`](Self::initialize), and drive installs through it.
pub struct LifecycleSupervisor {
    config: CoreConfig,
    repository: Arc<dyn PluginRepository>,
    bus: Arc<EventBus>,
    registry: PluginRegistry,
    resolver: DependencyResolver,
    validator: ValidatorPipeline,
    harness: SandboxHarness,
    artifact_cache: RwLock<HashMap<(String, Version), PluginArtifact>>,
    init: OnceCell<()>,
    ready: AtomicBool,
}

impl LifecycleSupervisor {
    pub fn new(config: CoreConfig, repository: Arc<dyn PluginRepository>) -> Self {
        let bus = Arc::new(EventBus::new(config.bus_capacity));
        let registry = PluginRegistry::new(config.session_history);
        let resolver =
            DependencyResolver::new(config.max_dependency_depth, config.enable_marketplace);
        let validator = ValidatorPipeline::new(config.enable_security_validation);
        let harness = SandboxHarness::new(config.sandbox_policy());
        Self {
            config,
            repository,
            bus,
            registry,
            resolver,
            validator,
            harness,
            artifact_cache: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
            ready: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Bring the core up. Idempotent: a second call while initialization is
    /// in progress awaits the in-flight completion instead of starting over.
    pub async fn initialize(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                for module in MODULE_ORDER {
                    self.bus.publish(BusEvent::ModuleReady {
                        module: module.to_string(),
                    });
                    info!(module, "Module ready");
                }
                self.ready.store(true, Ordering::SeqCst);
                self.bus.publish(BusEvent::CoreReady);
                info!("Lifecycle core ready");
                Ok::<(), CoreError>(())
            })
            .await
            .map(|_| ())
    }

    /// Tear the core down in reverse order, releasing every sandbox and
    /// removing every entry.
    pub async fn shutdown(&self) -> Result<()> {
        self.ensure_ready()?;
        let entries = self.registry.list_all().await;
        for entry in entries.iter().rev() {
            let id = entry.artifact.manifest.id.clone();
            match entry.state {
                EntryState::Active => {
                    self.registry.transition(&id, EntryState::Stopping).await?;
                    self.registry.remove(&id).await?;
                }
                EntryState::Stopping | EntryState::Quarantined => {
                    self.registry.remove(&id).await?;
                }
                _ => {
                    // Mid-install entries are abandoned.
                    let _ = self.registry.transition(&id, EntryState::Quarantined).await;
                    let _ = self.registry.remove(&id).await;
                }
            }
            self.bus.publish(BusEvent::PluginRemoved { id });
        }
        self.ready.store(false, Ordering::SeqCst);
        self.bus.publish(BusEvent::ShutdownComplete);
        info!("Lifecycle core shut down");
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::NotReady)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Install
    // ─────────────────────────────────────────────────────────────────────────

    /// Install a plugin and its dependencies.
    pub async fn install(&self, id: &str, token: &CancellationToken) -> Result<InstallResult> {
        self.install_many(&[id], token).await
    }

    /// Install several roots under one joint resolution, so shared
    /// dependencies are reconciled across all of them.
    pub async fn install_many(
        &self,
        ids: &[&str],
        token: &CancellationToken,
    ) -> Result<InstallResult> {
        self.ensure_ready()?;
        let deadline = self.config.install_deadline;
        let before: HashSet<String> = self
            .registry
            .list_all()
            .await
            .into_iter()
            .map(|e| e.artifact.manifest.id)
            .collect();
        match tokio::time::timeout(deadline, self.install_inner(ids, token)).await {
            Ok(result) => result,
            Err(_) => {
                self.erase_admitted_since(&before).await;
                Err(CoreError::DeadlineExceeded(deadline))
            }
        }
    }

    /// Erase every entry a timed-out request admitted, mid-install or fully
    /// activated, so the caller finds the registry as it was before the
    /// request.
    async fn erase_admitted_since(&self, before: &HashSet<String>) {
        for entry in self.registry.list_all().await {
            let id = entry.artifact.manifest.id.clone();
            if before.contains(&id) {
                continue;
            }
            warn!(plugin = %id, "Install deadline expired, erasing admitted entry");
            match entry.state {
                EntryState::Active => {
                    let _ = self.registry.transition(&id, EntryState::Stopping).await;
                    let _ = self.registry.remove(&id).await;
                    self.bus.publish(BusEvent::PluginRemoved { id });
                }
                _ => self.abandon_entry(&id, true).await,
            }
        }
    }

    async fn install_inner(&self, ids: &[&str], token: &CancellationToken) -> Result<InstallResult> {
        let mut roots = Vec::with_capacity(ids.len());
        for id in ids {
            self.bus.publish(BusEvent::InstallStarted {
                plugin: id.to_string(),
            });
            let manifest = self
                .repository
                .find(id, token)
                .await?
                .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
            manifest.validate()?;
            roots.push(manifest);
        }

        let installed = self.registry.installed_versions().await;
        let (plan, stats) = if self.config.enable_dependency_resolution {
            self.resolver
                .resolve(&roots, self.repository.as_ref(), &installed, token)
                .await?
        } else {
            (degenerate_plan(&roots), ResolutionStats::default())
        };

        self.bus.publish(BusEvent::PlanResolved {
            roots: ids.iter().map(|s| s.to_string()).collect(),
            plan_size: plan.entries.len(),
            stats,
        });
        for warning in &plan.warnings {
            self.bus.publish(BusEvent::ResolutionWarning {
                message: warning.clone(),
            });
        }

        let mut result = InstallResult {
            installed: Vec::new(),
            skipped: Vec::new(),
            warnings: plan.warnings.clone(),
        };

        // Fail fast: the first failing entry aborts the rest of the plan,
        // but predecessors stay active.
        for entry in &plan.entries {
            if entry.already_installed {
                result.skipped.push(entry.reference.clone());
                continue;
            }
            match self.install_entry(&entry.reference, token).await {
                Ok(reference) => {
                    self.bus.publish(BusEvent::InstallCompleted {
                        reference: reference.clone(),
                    });
                    result.installed.push(reference);
                }
                Err(e) => {
                    self.bus.publish(BusEvent::InstallFailed {
                        plugin: entry.reference.id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        Ok(result)
    }

    async fn install_entry(
        &self,
        reference: &PluginRef,
        token: &CancellationToken,
    ) -> Result<PluginRef> {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        // An active entry at another version is an upgrade when auto-updates
        // are on, a conflict otherwise.
        if let Some(existing) = self.registry.get(&reference.id).await {
            if existing.state == EntryState::Active {
                if self.config.enable_auto_updates
                    && reference.version > existing.artifact.manifest.version
                {
                    return self
                        .upgrade(
                            &reference.id,
                            &VersionConstraint::Exact(reference.version),
                            token,
                        )
                        .await;
                }
                return Err(CoreError::RegistryConflict(format!(
                    "plugin '{}' is already active at {}",
                    reference.id, existing.artifact.manifest.version
                )));
            }
        }

        let artifact = self.fetch_artifact(reference, token).await?;
        artifact.manifest.validate()?;

        self.registry.admit(artifact.clone()).await?;
        let outcome = match self.run_stages(&reference.id, &artifact, token).await {
            Ok(session) => self.harness.load(&artifact).map(|handle| (session, handle)),
            Err(e) => Err(e),
        };
        match outcome {
            Ok((session, handle)) => {
                self.registry
                    .transition(&reference.id, EntryState::Active)
                    .await?;
                self.registry
                    .attach_session(&reference.id, session.id)
                    .await?;
                self.registry.attach_handle(&reference.id, handle).await?;
                self.bus.publish(BusEvent::PluginRegistered {
                    reference: reference.clone(),
                });
                self.publish_state_change(&reference.id, "sandboxing", "active");
                Ok(reference.clone())
            }
            Err(e) => {
                self.abandon_entry(&reference.id, matches!(e, CoreError::Cancelled))
                    .await;
                Err(e)
            }
        }
    }

    /// Validate then sandbox one admitted entry (live id or staging key).
    /// The caller decides what a failure does to the entry.
    async fn run_stages(
        &self,
        key: &str,
        artifact: &PluginArtifact,
        token: &CancellationToken,
    ) -> Result<SandboxSession> {
        let id = &artifact.manifest.id;

        self.registry.transition(key, EntryState::Validating).await?;
        let report = self.validator.validate(artifact);
        self.bus.publish(BusEvent::ValidationCompleted {
            plugin: id.clone(),
            score: report.score,
            safe: report.safe,
            valid: report.valid,
            findings: report.findings.clone(),
        });

        if !report.valid {
            let details = report
                .findings
                .iter()
                .find(|f| f.kind == crate::validator::FindingKind::SyntaxError)
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "syntax pass failed".to_string());
            return Err(CoreError::SyntaxInvalid(details));
        }
        if !report.safe && !self.config.allow_unsafe {
            let details = report
                .findings_at_least(crate::validator::Severity::High)
                .map(|f| f.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(CoreError::PolicyViolation {
                id: id.clone(),
                details,
            });
        }

        self.registry.transition(key, EntryState::Sandboxing).await?;
        let session = self.harness.run(artifact, token).await?;
        self.registry.record_session(session.clone()).await;
        let score = aggregate_score(&report, &session);
        self.bus.publish(BusEvent::SandboxCompleted {
            plugin: id.clone(),
            session: session.id,
            passed: session.passed,
            coverage: session.coverage,
            score,
        });

        if !session.passed {
            if let Some(load_error) = &session.load_error {
                return Err(CoreError::SandboxLoadFailed {
                    id: id.clone(),
                    details: load_error.clone(),
                });
            }
            let failed = session
                .outcomes
                .iter()
                .find(|o| !o.passed)
                .expect("a failed outcome");
            if failed.timed_out {
                return Err(CoreError::SandboxTimeout {
                    id: id.clone(),
                    entry: failed.name.clone(),
                });
            }
            return Err(CoreError::EntryPointFailed {
                id: id.clone(),
                entry: failed.name.clone(),
                details: failed.error.clone().unwrap_or_default(),
            });
        }

        Ok(session)
    }

    /// Quarantine a failed mid-install entry, or erase it entirely when the
    /// request was cancelled so the registry is left unchanged.
    async fn abandon_entry(&self, key: &str, erase: bool) {
        let _ = self.registry.transition(key, EntryState::Quarantined).await;
        if erase {
            let _ = self.registry.remove(key).await;
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Uninstall / upgrade
    // ─────────────────────────────────────────────────────────────────────────

    /// Remove an active plugin.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        self.ensure_ready()?;
        self.registry.transition(id, EntryState::Stopping).await?;
        self.publish_state_change(id, "active", "stopping");
        self.registry.remove(id).await?;
        self.bus.publish(BusEvent::PluginRemoved { id: id.to_string() });
        Ok(())
    }

    /// Upgrade an active plugin to the best available version satisfying
    /// `constraint`. The swap is atomic: observers see the old version until
    /// the staged one has fully passed validation and sandboxing.
    pub async fn upgrade(
        &self,
        id: &str,
        constraint: &VersionConstraint,
        token: &CancellationToken,
    ) -> Result<PluginRef> {
        self.ensure_ready()?;
        let current = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| CoreError::PluginNotRegistered(id.to_string()))?;
        let current_version = current.artifact.manifest.version;

        let candidates = if self.config.enable_marketplace {
            self.repository.list_versions(id, token).await?
        } else {
            self.repository
                .find(id, token)
                .await?
                .map(|m| vec![m.version])
                .unwrap_or_default()
        };
        let target = constraint
            .best(&candidates)
            .ok_or_else(|| CoreError::NotAvailable {
                id: id.to_string(),
                version: constraint.to_string(),
            })?;
        if target == current_version {
            return Ok(current.reference());
        }

        let reference = PluginRef::new(id, target);
        let artifact = self.fetch_artifact(&reference, token).await?;
        artifact.manifest.validate()?;

        let staging = self.registry.stage_upgrade(artifact.clone()).await?;
        self.registry.transition(id, EntryState::Upgrading).await?;
        self.publish_state_change(id, "active", "upgrading");

        let outcome = match self.run_stages(&staging, &artifact, token).await {
            Ok(session) => self.harness.load(&artifact).map(|handle| (session, handle)),
            Err(e) => Err(e),
        };
        match outcome {
            Ok((session, handle)) => {
                self.registry.attach_session(&staging, session.id).await?;
                // Promotion moves the staged entry wholesale, handle included.
                self.registry.attach_handle(&staging, handle).await?;
                let (old, new) = self.registry.promote(id).await?;
                self.bus.publish(BusEvent::PluginUpgraded {
                    id: id.to_string(),
                    from: old,
                    to: new.clone(),
                });
                self.publish_state_change(id, "upgrading", "active");
                Ok(new)
            }
            Err(e) => {
                // The live entry never left service.
                let _ = self.registry.discard_staged(id).await;
                let _ = self.registry.transition(id, EntryState::Active).await;
                self.publish_state_change(id, "upgrading", "active");
                self.bus.publish(BusEvent::InstallFailed {
                    plugin: id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries and calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Caller-facing registry snapshots.
    pub async fn list(&self) -> Vec<RegistrySnapshot> {
        self.registry.list().await
    }

    /// Retained sandbox sessions, oldest first.
    pub async fn sessions(&self) -> Vec<SandboxSession> {
        self.registry.sessions().await
    }

    /// Invoke an advertised function of an active plugin with JSON
    /// arguments.
    pub async fn call_function(
        &self,
        id: &str,
        function: &str,
        args: Vec<serde_json::Value>,
        token: &CancellationToken,
    ) -> Result<serde_json::Value> {
        self.ensure_ready()?;
        let entry = self.registry.active_entry(id).await?;
        let artifact = entry.artifact;
        if !artifact.manifest.functions.iter().any(|f| f.name == function) {
            return Err(CoreError::StructureMissing {
                id: id.to_string(),
                entry: function.to_string(),
            });
        }

        // Entries activated by this process carry their compiled handle; a
        // deserialized entry is compiled once here.
        let handle = match entry.handle {
            Some(handle) => handle,
            None => self.harness.load(&artifact)?,
        };

        let dynamic_args = args
            .into_iter()
            .map(|value| rhai::serde::to_dynamic(value))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Internal(format!("argument conversion failed: {e}")))?;

        let result = self
            .harness
            .call_function(&artifact, &handle, function, dynamic_args, token)
            .await?;
        rhai::serde::from_dynamic(&result)
            .map_err(|e| CoreError::Internal(format!("result conversion failed: {e}")))
    }

    /// Subscribe to a diagnostic topic.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe(topic)
    }

    /// Subscribe with a callback; dropping the guard disposes it.
    pub fn subscribe_fn<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(BusEvent) + Send + 'static,
    {
        self.bus.subscribe_fn(topic, callback)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    fn publish_state_change(&self, id: &str, from: &str, to: &str) {
        if self.config.verbose_diagnostics {
            self.bus.publish(BusEvent::StateChanged {
                id: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    /// Fetch an artifact, consulting the cache and retrying transient
    /// repository failures.
    async fn fetch_artifact(
        &self,
        reference: &PluginRef,
        token: &CancellationToken,
    ) -> Result<PluginArtifact> {
        let key = (reference.id.clone(), reference.version);
        if self.config.enable_caching {
            if let Some(cached) = self.artifact_cache.read().await.get(&key) {
                return Ok(cached.clone());
            }
        }

        let attempts = self.config.fetch_retry_attempts.max(1);
        let mut attempt = 0;
        let artifact = loop {
            attempt += 1;
            match self
                .repository
                .fetch(&reference.id, reference.version, token)
                .await
            {
                Ok(artifact) => break artifact,
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        plugin = %reference,
                        attempt,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        if self.config.enable_caching {
            self.artifact_cache
                .write()
                .await
                .insert(key, artifact.clone());
        }
        Ok(artifact)
    }
}

/// Plan used when dependency resolution is disabled: the roots alone.
/// Roots the caller named are never skipped; an active duplicate surfaces
/// as a registry conflict instead.
fn degenerate_plan(roots: &[PluginManifest]) -> InstallPlan {
    let mut plan = InstallPlan::default();
    for root in roots {
        if plan.resolved.contains_key(&root.id) {
            continue;
        }
        plan.resolved.insert(root.id.clone(), root.version);
        plan.entries.push(PlanEntry {
            reference: root.reference(),
            is_root: true,
            already_installed: false,
        });
    }
    plan
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
