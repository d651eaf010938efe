//! Sandbox harness: capability-gated evaluation of plugin code.
//!
//! The plugin script runs inside a `rhai` engine whose name bindings are an
//! explicit allow-list of host functions ([`host_api::MockHostApi`]). Dynamic
//! code evaluation is disabled at the language level, every entry point runs
//! under a cooperative per-call deadline plus an operation budget, and
//! timers are force-cleared on teardown. The harness never aborts on an
//! entry point failure; it records the outcome and keeps exercising the
//! remaining entries.

mod host_api;

pub use host_api::{MockHostApi, TimerKind};

use rhai::{Dynamic, Engine, EvalAltResult, Scope, AST};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::manifest::{Permission, PluginArtifact};
use crate::validator::ValidationReport;

// ═══════════════════════════════════════════════════════════════════════════════
// Sandbox Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration that governs what a sandboxed plugin is allowed to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Wall-clock budget per entry point call.
    #[serde(with = "humantime_serde")]
    pub entry_call_timeout: Duration,

    /// Script operation budget per run. 0 = unlimited.
    pub max_operations: u64,

    /// Permissions granted inside the sandbox. `None` mirrors the manifest's
    /// declared set.
    #[serde(default)]
    pub granted_permissions: Option<Vec<Permission>>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            entry_call_timeout: Duration::from_secs(2),
            max_operations: 500_000,
            granted_permissions: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of driving one entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPointOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the failure was the per-call deadline or operation budget.
    pub timed_out: bool,
}

/// Everything observed during one sandbox run. Retained in a bounded ring
/// buffer for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSession {
    pub id: Uuid,
    pub plugin_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub outcomes: Vec<EntryPointOutcome>,
    /// Fraction of exercised entry points that passed.
    pub coverage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    /// Timers the plugin created and never released; force-cleared on
    /// teardown.
    pub leaked_timers: usize,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Loaded, every exercised entry point passed.
    pub passed: bool,
}

impl SandboxSession {
    pub fn outcome(&self, name: &str) -> Option<&EntryPointOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }
}

/// Compiled form of an admitted plugin: the AST live calls execute plus the
/// policy the plugin was admitted under. Attached to the registry entry at
/// activation so invocations never recompile the script.
#[derive(Debug, Clone)]
pub struct PluginHandle {
    pub ast: AST,
    pub policy: SandboxPolicy,
}

/// Combine validation sub-scores with the sandbox verdict into one overall
/// score. Syntax validity, security, performance, and the sandbox result are
/// weighted equally.
pub fn aggregate_score(report: &ValidationReport, session: &SandboxSession) -> u8 {
    let parts: [u32; 4] = [
        if report.valid { 100 } else { 0 },
        report.security_score as u32,
        report.performance_score as u32,
        if session.passed { 100 } else { 0 },
    ];
    (parts.iter().sum::<u32>() / 4) as u8
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════════

/// Synthesize a deterministic argument from a parameter name or type hint.
fn fixture_for(name: &str, kind: &str) -> Dynamic {
    let hint = if kind.is_empty() { name } else { kind }.to_ascii_lowercase();

    if hint.contains("seq") {
        return "ACGTACGTAC".into();
    }
    if hint.contains("region") {
        let mut region = rhai::Map::new();
        region.insert("chrom".into(), "chr1".into());
        region.insert("start".into(), Dynamic::from(100_i64));
        region.insert("end".into(), Dynamic::from(200_i64));
        return Dynamic::from_map(region);
    }
    if hint.contains("[]") || hint.contains("array") || hint.contains("values") {
        return Dynamic::from_array(vec![
            Dynamic::from(1.0_f64),
            Dynamic::from(2.0_f64),
            Dynamic::from(3.0_f64),
        ]);
    }
    if hint.contains("option") || hint.contains("config") || hint.contains("settings") {
        return Dynamic::from_map(rhai::Map::new());
    }
    if hint.contains("count")
        || hint.contains("size")
        || hint.contains("window")
        || hint.contains("threshold")
        || hint == "n"
        || hint.contains("number")
    {
        return Dynamic::from(10_i64);
    }
    Dynamic::UNIT
}

// ═══════════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════════

/// Drives a plugin artifact through load, `init`, every advertised function,
/// and `destroy` inside the allow-list engine.
#[derive(Debug, Clone)]
pub struct SandboxHarness {
    policy: SandboxPolicy,
}

impl Default for SandboxHarness {
    fn default() -> Self {
        Self::new(SandboxPolicy::default())
    }
}

impl SandboxHarness {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Run the artifact to completion. Fails only on cancellation; every
    /// plugin-side failure is recorded in the returned session instead.
    pub async fn run(
        &self,
        artifact: &PluginArtifact,
        token: &CancellationToken,
    ) -> Result<SandboxSession> {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let started = Instant::now();
        let mut session = SandboxSession {
            id: Uuid::new_v4(),
            plugin_id: artifact.manifest.id.clone(),
            started_at: chrono::Utc::now(),
            outcomes: Vec::new(),
            coverage: 0.0,
            load_error: None,
            leaked_timers: 0,
            duration: Duration::ZERO,
            passed: false,
        };

        let granted: HashSet<Permission> = match &self.policy.granted_permissions {
            Some(grants) => grants.iter().copied().collect(),
            None => artifact.manifest.permissions.iter().copied().collect(),
        };
        let host = MockHostApi::new(granted);

        let deadline = Arc::new(Mutex::new(Instant::now() + self.policy.entry_call_timeout));
        let engine = Self::build_engine(&self.policy, &host, deadline.clone());

        debug!(
            plugin = %artifact.manifest.id,
            session = %session.id,
            "Sandbox run starting"
        );

        // Load: compile, then evaluate top-level statements once.
        let ast = match engine.compile(&artifact.code) {
            Ok(ast) => ast,
            Err(e) => {
                session.load_error = Some(format!("compile failed: {e}"));
                session.duration = started.elapsed();
                warn!(plugin = %artifact.manifest.id, error = %e, "Sandbox load failed");
                return Ok(session);
            }
        };

        let mut scope = Scope::new();
        Self::arm_deadline(&deadline, self.policy.entry_call_timeout);
        if let Err(e) = engine.run_ast_with_scope(&mut scope, &ast) {
            session.load_error = Some(format!("load failed: {e}"));
            session.leaked_timers = host.active_timers();
            host.clear_all_timers();
            session.duration = started.elapsed();
            warn!(plugin = %artifact.manifest.id, error = %e, "Sandbox load failed");
            return Ok(session);
        }

        // Entry points defined by the script, with their parameter names.
        let defined: HashMap<String, Vec<String>> = ast
            .iter_functions()
            .map(|f| {
                (
                    f.name.to_string(),
                    f.params.iter().map(|p| p.to_string()).collect(),
                )
            })
            .collect();

        // Calls go against the function bodies only so top-level statements
        // never re-run.
        let functions = ast.clone_functions_only();

        let mut entries: Vec<(String, Vec<Dynamic>)> = vec![("init".into(), Vec::new())];
        for function in &artifact.manifest.functions {
            let args = if function.params.is_empty() {
                defined
                    .get(&function.name)
                    .map(|params| {
                        params.iter().map(|p| fixture_for(p, "")).collect()
                    })
                    .unwrap_or_default()
            } else {
                function
                    .params
                    .iter()
                    .map(|p| fixture_for(&p.name, &p.kind))
                    .collect()
            };
            entries.push((function.name.clone(), args));
        }
        if defined.contains_key("destroy") {
            entries.push(("destroy".into(), Vec::new()));
        }

        for (name, args) in entries {
            if token.is_cancelled() {
                host.clear_all_timers();
                return Err(CoreError::Cancelled);
            }
            let outcome = self.call_entry(&engine, &mut scope, &functions, &deadline, &name, args);
            session.outcomes.push(outcome);
            // Yield between calls so long runs stay cooperative.
            tokio::task::yield_now().await;
        }

        session.leaked_timers = host.active_timers();
        host.clear_all_timers();

        let total = session.outcomes.len();
        let passed_count = session.outcomes.iter().filter(|o| o.passed).count();
        session.coverage = if total == 0 {
            1.0
        } else {
            passed_count as f64 / total as f64
        };
        session.passed = session.load_error.is_none() && passed_count == total;
        session.duration = started.elapsed();

        info!(
            plugin = %artifact.manifest.id,
            session = %session.id,
            passed = session.passed,
            coverage = session.coverage,
            leaked_timers = session.leaked_timers,
            "Sandbox run complete"
        );
        Ok(session)
    }

    /// Compile an artifact into the handle live calls execute. The engine is
    /// configured exactly as for a full run, so anything rejected there is
    /// rejected here too. The returned handle carries the resolved grant set.
    pub fn load(&self, artifact: &PluginArtifact) -> Result<PluginHandle> {
        let granted = match &self.policy.granted_permissions {
            Some(grants) => grants.clone(),
            None => artifact.manifest.permissions.clone(),
        };
        let host = MockHostApi::new(granted.iter().copied().collect());
        let deadline = Arc::new(Mutex::new(Instant::now() + self.policy.entry_call_timeout));
        let engine = Self::build_engine(&self.policy, &host, deadline);

        let ast = engine
            .compile(&artifact.code)
            .map_err(|e| CoreError::SandboxLoadFailed {
                id: artifact.manifest.id.clone(),
                details: e.to_string(),
            })?;
        Ok(PluginHandle {
            ast,
            policy: SandboxPolicy {
                granted_permissions: Some(granted),
                ..self.policy.clone()
            },
        })
    }

    /// Invoke one entry point of an already-registered plugin through its
    /// compiled handle. Used for live function calls after installation;
    /// isolation rules are identical to a full run.
    pub async fn call_function(
        &self,
        artifact: &PluginArtifact,
        handle: &PluginHandle,
        name: &str,
        args: Vec<Dynamic>,
        token: &CancellationToken,
    ) -> Result<Dynamic> {
        if token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let id = &artifact.manifest.id;
        let policy = &handle.policy;

        let granted: HashSet<Permission> = match &policy.granted_permissions {
            Some(grants) => grants.iter().copied().collect(),
            None => artifact.manifest.permissions.iter().copied().collect(),
        };
        let host = MockHostApi::new(granted);
        let deadline = Arc::new(Mutex::new(Instant::now() + policy.entry_call_timeout));
        let engine = Self::build_engine(policy, &host, deadline.clone());

        // Top-level statements run in a fresh scope per call; the compiled
        // AST is reused as-is.
        let mut scope = Scope::new();
        Self::arm_deadline(&deadline, policy.entry_call_timeout);
        engine
            .run_ast_with_scope(&mut scope, &handle.ast)
            .map_err(|e| CoreError::SandboxLoadFailed {
                id: id.clone(),
                details: e.to_string(),
            })?;

        let functions = handle.ast.clone_functions_only();
        Self::arm_deadline(&deadline, policy.entry_call_timeout);
        let result = engine.call_fn::<Dynamic>(&mut scope, &functions, name, args);
        host.clear_all_timers();

        match result {
            Ok(value) => Ok(value),
            Err(e)
                if matches!(
                    *e,
                    EvalAltResult::ErrorTerminated(..)
                        | EvalAltResult::ErrorTooManyOperations(..)
                ) =>
            {
                Err(CoreError::SandboxTimeout {
                    id: id.clone(),
                    entry: name.to_string(),
                })
            }
            Err(e) => Err(CoreError::EntryPointFailed {
                id: id.clone(),
                entry: name.to_string(),
                details: e.to_string(),
            }),
        }
    }

    fn build_engine(policy: &SandboxPolicy, host: &MockHostApi, deadline: Arc<Mutex<Instant>>) -> Engine {
        let mut engine = Engine::new();
        engine.disable_symbol("eval");
        if policy.max_operations > 0 {
            engine.set_max_operations(policy.max_operations);
        }
        engine.on_progress(move |_| {
            if Instant::now() > *deadline.lock().unwrap() {
                Some("deadline".into())
            } else {
                None
            }
        });
        host.register(&mut engine);
        engine
    }

    fn arm_deadline(deadline: &Arc<Mutex<Instant>>, timeout: Duration) {
        *deadline.lock().unwrap() = Instant::now() + timeout;
    }

    fn call_entry(
        &self,
        engine: &Engine,
        scope: &mut Scope,
        functions: &AST,
        deadline: &Arc<Mutex<Instant>>,
        name: &str,
        args: Vec<Dynamic>,
    ) -> EntryPointOutcome {
        let call_started = Instant::now();
        Self::arm_deadline(deadline, self.policy.entry_call_timeout);

        let result = engine.call_fn::<Dynamic>(scope, functions, name, args);
        let duration = call_started.elapsed();

        match result {
            Ok(_) => EntryPointOutcome {
                name: name.to_string(),
                passed: true,
                duration,
                error: None,
                timed_out: false,
            },
            Err(e) => {
                let timed_out = matches!(
                    *e,
                    EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..)
                );
                let error = if timed_out {
                    format!("entry point exceeded its execution budget: {e}")
                } else {
                    e.to_string()
                };
                debug!(entry = name, error = %error, "Entry point failed");
                EntryPointOutcome {
                    name: name.to_string(),
                    passed: false,
                    duration,
                    error: Some(error),
                    timed_out,
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PluginManifest;

    fn artifact(manifest_json: &str, code: &str) -> PluginArtifact {
        PluginArtifact::new(PluginManifest::from_json(manifest_json).unwrap(), code)
    }

    fn harness() -> SandboxHarness {
        SandboxHarness::default()
    }

    #[tokio::test]
    async fn test_clean_plugin_full_coverage() {
        let a = artifact(
            r#"{"id": "gc", "version": "1.0.0",
                "functions": [{"name": "gc_percent",
                               "params": [{"name": "sequence", "kind": "sequence"}]}]}"#,
            r#"
            fn init() { log_info("ready"); }
            fn metadata() { #{ id: "gc" } }
            fn gc_percent(sequence) {
                let gc = 0;
                for c in sequence.chars() {
                    if c == 'G' || c == 'C' { gc += 1; }
                }
                gc
            }
            fn destroy() { }
            "#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert!(session.passed);
        assert_eq!(session.coverage, 1.0);
        assert!(session.load_error.is_none());
        assert_eq!(session.leaked_timers, 0);
        // init, gc_percent, destroy.
        assert_eq!(session.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_failing_entry_does_not_abort_remaining() {
        let a = artifact(
            r#"{"id": "mixed", "version": "1.0.0",
                "functions": [{"name": "f"}, {"name": "g"}]}"#,
            r#"
            fn init() { }
            fn metadata() { #{ id: "mixed" } }
            fn f() { 42 }
            fn g() { throw "boom"; }
            fn destroy() { }
            "#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert!(!session.passed);
        assert!(session.outcome("f").unwrap().passed);
        let g = session.outcome("g").unwrap();
        assert!(!g.passed);
        assert!(g.error.as_deref().unwrap().contains("boom"));
        // destroy still ran after the failure.
        assert!(session.outcome("destroy").unwrap().passed);
    }

    #[tokio::test]
    async fn test_load_failure_sets_passed_false() {
        let a = artifact(
            r#"{"id": "broken", "version": "1.0.0"}"#,
            "fn init() {\nlet x = ;\n}",
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert!(!session.passed);
        assert!(session.load_error.is_some());
        assert!(session.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_eval_is_disabled_at_the_language_level() {
        let a = artifact(
            r#"{"id": "evil", "version": "1.0.0"}"#,
            r#"fn init() { eval("1 + 1"); }"#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert!(session.load_error.is_some());
    }

    #[tokio::test]
    async fn test_leaked_timers_are_counted_and_cleared() {
        let a = artifact(
            r#"{"id": "leaky", "version": "1.0.0"}"#,
            r#"
            fn init() { set_interval(|| log_info("tick"), 50); }
            fn metadata() { #{} }
            "#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert_eq!(session.leaked_timers, 1);
    }

    #[tokio::test]
    async fn test_undeclared_permission_fails_inside_sandbox() {
        let a = artifact(
            r#"{"id": "netless", "version": "1.0.0", "functions": [{"name": "pull"}]}"#,
            r#"
            fn init() { }
            fn pull() { http_get("https://x.test") }
            "#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        let pull = session.outcome("pull").unwrap();
        assert!(!pull.passed);
        assert!(pull.error.as_deref().unwrap().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_runaway_entry_times_out() {
        let policy = SandboxPolicy {
            entry_call_timeout: Duration::from_millis(50),
            max_operations: 0,
            granted_permissions: None,
        };
        let a = artifact(
            r#"{"id": "spin", "version": "1.0.0"}"#,
            r#"
            fn init() { loop { } }
            "#,
        );
        let session = SandboxHarness::new(policy)
            .run(&a, &CancellationToken::new())
            .await
            .unwrap();
        let init = session.outcome("init").unwrap();
        assert!(!init.passed);
        assert!(init.timed_out);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_the_run() {
        let token = CancellationToken::new();
        token.cancel();
        let a = artifact(r#"{"id": "c", "version": "1.0.0"}"#, "fn init() { }");
        let err = harness().run(&a, &token).await.unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_fixture_synthesis_by_param_names() {
        let a = artifact(
            r#"{"id": "fx", "version": "1.0.0",
                "functions": [{"name": "scan",
                               "params": [{"name": "sequence"},
                                          {"name": "region"},
                                          {"name": "window_size"}]}]}"#,
            r#"
            fn init() { }
            fn scan(sequence, region, window_size) {
                if sequence.len == 0 { throw "empty sequence"; }
                if region.chrom != "chr1" { throw "bad region"; }
                if window_size <= 0 { throw "bad window"; }
                true
            }
            "#,
        );
        let session = harness().run(&a, &CancellationToken::new()).await.unwrap();
        assert!(session.outcome("scan").unwrap().passed);
    }

    #[tokio::test]
    async fn test_call_function_executes_compiled_handle() {
        let a = artifact(
            r#"{"id": "adder", "version": "1.0.0",
                "functions": [{"name": "add"}]}"#,
            "fn init() { }\nfn add(a, b) { a + b }",
        );
        let h = harness();
        let handle = h.load(&a).unwrap();
        let result = h
            .call_function(
                &a,
                &handle,
                "add",
                vec![Dynamic::from(2_i64), Dynamic::from(3_i64)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.as_int().unwrap(), 5);
        // The handle carries the resolved grant set.
        assert!(handle.policy.granted_permissions.is_some());
    }

    #[tokio::test]
    async fn test_load_rejects_uncompilable_code() {
        let a = artifact(r#"{"id": "broken", "version": "1.0.0"}"#, "fn init( {");
        let err = harness().load(&a).unwrap_err();
        assert!(matches!(err, CoreError::SandboxLoadFailed { .. }));
    }

    #[test]
    fn test_aggregate_score_weights_equally() {
        use crate::validator::ValidatorPipeline;
        let a = artifact(
            r#"{"id": "s", "version": "1.0.0"}"#,
            "fn init() { }\nfn metadata() { }\nfn destroy() { }",
        );
        let report = ValidatorPipeline::default().validate(&a);
        let session = SandboxSession {
            id: Uuid::new_v4(),
            plugin_id: "s".into(),
            started_at: chrono::Utc::now(),
            outcomes: Vec::new(),
            coverage: 1.0,
            load_error: None,
            leaked_timers: 0,
            duration: Duration::ZERO,
            passed: true,
        };
        assert_eq!(aggregate_score(&report, &session), 100);

        let failed = SandboxSession {
            passed: false,
            ..session
        };
        assert_eq!(aggregate_score(&report, &failed), 75);
    }
}
