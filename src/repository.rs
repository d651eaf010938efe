//! Repository port: abstract lookup of plugins and their available versions.
//!
//! Implementations are external collaborators (marketplace clients, local
//! directories). The core treats them as untrusted for correctness: errors
//! are wrapped, absence is `Ok(None)`, and every call accepts a cancellation
//! token so long lookups can be abandoned at await points.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::manifest::{PluginArtifact, PluginManifest};
use crate::version::Version;

// ═══════════════════════════════════════════════════════════════════════════════
// Repository Port
// ═══════════════════════════════════════════════════════════════════════════════

/// Capability set the lifecycle core consumes from a plugin repository.
#[async_trait]
pub trait PluginRepository: Send + Sync {
    /// Return the currently advertised manifest for `id`, or `None` when the
    /// plugin is unknown. Absence is not an error.
    async fn find(&self, id: &str, token: &CancellationToken) -> Result<Option<PluginManifest>>;

    /// List available versions for `id` in ascending order. May be empty.
    async fn list_versions(&self, id: &str, token: &CancellationToken) -> Result<Vec<Version>>;

    /// Fetch the artifact for an exact version. Fails with `NotAvailable`
    /// when the version is no longer obtainable.
    async fn fetch(
        &self,
        id: &str,
        version: Version,
        token: &CancellationToken,
    ) -> Result<PluginArtifact>;
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(CoreError::Cancelled)
    } else {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Repository
// ═══════════════════════════════════════════════════════════════════════════════

/// An in-memory repository backed by a map of published artifacts.
///
/// Hosts use this for marketplace snapshots; every integration test uses it
/// as the injected repository. The advertised manifest for an id is the one
/// with the highest published version.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<RepositoryInner>>,
}

#[derive(Debug, Default)]
struct RepositoryInner {
    /// id -> version -> artifact.
    artifacts: HashMap<String, HashMap<Version, PluginArtifact>>,
    /// Versions withdrawn from distribution but still advertised in listings.
    yanked: HashMap<String, Vec<Version>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an artifact. Replaces any artifact previously published under
    /// the same `(id, version)`.
    pub async fn publish(&self, artifact: PluginArtifact) {
        let reference = artifact.reference();
        let mut inner = self.inner.write().await;
        inner
            .artifacts
            .entry(reference.id.clone())
            .or_default()
            .insert(reference.version, artifact);
        debug!(plugin = %reference, "Artifact published");
    }

    /// Withdraw a version from distribution. `fetch` will fail with
    /// `NotAvailable` while `list_versions` keeps advertising it, which is
    /// how real marketplaces behave during takedowns.
    pub async fn yank(&self, id: &str, version: Version) {
        let mut inner = self.inner.write().await;
        inner.yanked.entry(id.to_string()).or_default().push(version);
    }
}

#[async_trait]
impl PluginRepository for InMemoryRepository {
    async fn find(&self, id: &str, token: &CancellationToken) -> Result<Option<PluginManifest>> {
        check_cancelled(token)?;
        let inner = self.inner.read().await;
        Ok(inner.artifacts.get(id).and_then(|versions| {
            versions
                .iter()
                .max_by_key(|(v, _)| **v)
                .map(|(_, artifact)| artifact.manifest.clone())
        }))
    }

    async fn list_versions(&self, id: &str, token: &CancellationToken) -> Result<Vec<Version>> {
        check_cancelled(token)?;
        let inner = self.inner.read().await;
        let mut versions: Vec<Version> = inner
            .artifacts
            .get(id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        versions.sort();
        Ok(versions)
    }

    async fn fetch(
        &self,
        id: &str,
        version: Version,
        token: &CancellationToken,
    ) -> Result<PluginArtifact> {
        check_cancelled(token)?;
        let inner = self.inner.read().await;

        let yanked = inner
            .yanked
            .get(id)
            .map(|v| v.contains(&version))
            .unwrap_or(false);
        if yanked {
            return Err(CoreError::NotAvailable {
                id: id.to_string(),
                version: version.to_string(),
            });
        }

        inner
            .artifacts
            .get(id)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| CoreError::NotAvailable {
                id: id.to_string(),
                version: version.to_string(),
            })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
