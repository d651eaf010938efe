//! Event and diagnostic bus.
//!
//! Topic-keyed publish/subscribe over bounded broadcast channels. Publishers
//! never block: a slow subscriber that falls behind its queue capacity loses
//! the oldest entries. Correctness of the lifecycle core never depends on a
//! subscriber being attached; the bus carries diagnostics only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::manifest::PluginRef;
use crate::resolver::ResolutionStats;
use crate::validator::Finding;

// ═══════════════════════════════════════════════════════════════════════════════
// Topics
// ═══════════════════════════════════════════════════════════════════════════════

/// The five diagnostic topics. Delivery is ordered and at-most-once per
/// subscriber within a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Lifecycle,
    Resolution,
    Validation,
    Sandbox,
    Registry,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Lifecycle,
        Topic::Resolution,
        Topic::Validation,
        Topic::Sandbox,
        Topic::Registry,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Resolution => "resolution",
            Self::Validation => "validation",
            Self::Sandbox => "sandbox",
            Self::Registry => "registry",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the core reports on the bus. Each variant belongs to exactly
/// one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    // Lifecycle topic
    ModuleReady { module: String },
    CoreReady,
    InstallStarted { plugin: String },
    InstallCompleted { reference: PluginRef },
    InstallFailed { plugin: String, error: String },
    ShutdownComplete,

    // Resolution topic
    PlanResolved {
        roots: Vec<String>,
        plan_size: usize,
        stats: ResolutionStats,
    },
    ResolutionWarning { message: String },

    // Validation topic
    ValidationCompleted {
        plugin: String,
        score: u8,
        safe: bool,
        valid: bool,
        findings: Vec<Finding>,
    },

    // Sandbox topic
    SandboxCompleted {
        plugin: String,
        session: Uuid,
        passed: bool,
        coverage: f64,
        /// Overall score combining validation sub-scores with the sandbox
        /// verdict.
        score: u8,
    },

    // Registry topic
    PluginRegistered { reference: PluginRef },
    PluginRemoved { id: String },
    PluginUpgraded {
        id: String,
        from: PluginRef,
        to: PluginRef,
    },
    StateChanged {
        id: String,
        from: String,
        to: String,
    },
}

impl BusEvent {
    /// The topic this event is published on.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::ModuleReady { .. }
            | Self::CoreReady
            | Self::InstallStarted { .. }
            | Self::InstallCompleted { .. }
            | Self::InstallFailed { .. }
            | Self::ShutdownComplete => Topic::Lifecycle,
            Self::PlanResolved { .. } | Self::ResolutionWarning { .. } => Topic::Resolution,
            Self::ValidationCompleted { .. } => Topic::Validation,
            Self::SandboxCompleted { .. } => Topic::Sandbox,
            Self::PluginRegistered { .. }
            | Self::PluginRemoved { .. }
            | Self::PluginUpgraded { .. }
            | Self::StateChanged { .. } => Topic::Registry,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EventBus
// ═══════════════════════════════════════════════════════════════════════════════

/// Bounded per-topic broadcast bus.
#[derive(Debug)]
pub struct EventBus {
    senders: HashMap<Topic, broadcast::Sender<BusEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventBus {
    /// `capacity` bounds each topic's per-subscriber backlog.
    pub fn new(capacity: usize) -> Self {
        let senders = Topic::ALL
            .iter()
            .map(|topic| {
                let (tx, _) = broadcast::channel(capacity.max(1));
                (*topic, tx)
            })
            .collect();
        Self { senders }
    }

    /// Publish an event on its topic. Never blocks; an event with no
    /// subscribers is dropped silently.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        trace!(topic = %topic, "Bus publish");
        let _ = self.senders[&topic].send(event);
    }

    /// Subscribe to a topic. The receiver observes events published after
    /// this call, in order, dropping oldest on overflow.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BusEvent> {
        self.senders[&topic].subscribe()
    }

    /// Subscribe with a callback driven by a background task. Dropping the
    /// returned guard disposes the subscription.
    pub fn subscribe_fn<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(BusEvent) + Send + 'static,
    {
        let mut receiver = self.subscribe(topic);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.senders[&topic].receiver_count()
    }
}

/// Guard for a callback subscription; aborts the driver task on drop.
#[derive(Debug)]
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
