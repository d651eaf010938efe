//! Deterministic mock host API injected into the sandbox.
//!
//! Every host binding the plugin can reach is registered here, so the
//! evaluation environment is an explicit allow-list. Mocked operations have
//! fixed, documented outputs; side effects are recorded in a trace the
//! harness inspects after the run. Capability checks mirror the manifest
//! permission model: a call without its granted permission fails inside the
//! script rather than reaching any real collaborator.

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::manifest::Permission;

// ═══════════════════════════════════════════════════════════════════════════════
// Trace
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of a cooperative timer created by the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Timeout,
    Interval,
}

#[derive(Debug, Default)]
struct HostTrace {
    logs: Vec<(&'static str, String)>,
    files: HashMap<String, String>,
    network: Vec<String>,
    ui: Vec<String>,
    ai_functions: Vec<String>,
    timers: HashMap<i64, TimerKind>,
    next_timer: i64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// MockHostApi
// ═══════════════════════════════════════════════════════════════════════════════

/// The stubbed host surface a sandboxed plugin runs against.
#[derive(Debug, Clone)]
pub struct MockHostApi {
    granted: HashSet<Permission>,
    trace: Arc<Mutex<HostTrace>>,
}

impl MockHostApi {
    pub fn new(granted: HashSet<Permission>) -> Self {
        Self {
            granted,
            trace: Arc::new(Mutex::new(HostTrace::default())),
        }
    }

    fn denied(permission: Permission) -> Box<EvalAltResult> {
        format!("permission denied: {permission}").into()
    }

    /// Register every host binding on the engine. Nothing outside this set is
    /// visible to the plugin.
    pub fn register(&self, engine: &mut Engine) {
        self.register_logging(engine);
        self.register_timers(engine);
        self.register_files(engine);
        self.register_network(engine);
        self.register_ui(engine);
        self.register_data(engine);
        self.register_ai(engine);
    }

    fn register_logging(&self, engine: &mut Engine) {
        let trace = self.trace.clone();
        engine.register_fn("log_info", move |message: &str| {
            trace.lock().unwrap().logs.push(("info", message.into()));
        });
        let trace = self.trace.clone();
        engine.register_fn("log_warn", move |message: &str| {
            trace.lock().unwrap().logs.push(("warn", message.into()));
        });
    }

    fn register_timers(&self, engine: &mut Engine) {
        // Timers are recorded, never fired: the harness only needs to know
        // what was created and what was released.
        let trace = self.trace.clone();
        engine.register_fn("set_timeout", move |_callback: FnPtr, _ms: i64| -> i64 {
            let mut t = trace.lock().unwrap();
            t.next_timer += 1;
            let handle = t.next_timer;
            t.timers.insert(handle, TimerKind::Timeout);
            handle
        });
        // String-body overload kept for compatibility; the body is never
        // evaluated.
        let trace = self.trace.clone();
        engine.register_fn("set_timeout", move |_body: &str, _ms: i64| -> i64 {
            let mut t = trace.lock().unwrap();
            t.next_timer += 1;
            let handle = t.next_timer;
            t.timers.insert(handle, TimerKind::Timeout);
            handle
        });
        let trace = self.trace.clone();
        engine.register_fn("set_interval", move |_callback: FnPtr, _ms: i64| -> i64 {
            let mut t = trace.lock().unwrap();
            t.next_timer += 1;
            let handle = t.next_timer;
            t.timers.insert(handle, TimerKind::Interval);
            handle
        });
        let trace = self.trace.clone();
        engine.register_fn("clear_timeout", move |handle: i64| {
            trace.lock().unwrap().timers.remove(&handle);
        });
        let trace = self.trace.clone();
        engine.register_fn("clear_interval", move |handle: i64| {
            trace.lock().unwrap().timers.remove(&handle);
        });
    }

    fn register_files(&self, engine: &mut Engine) {
        let trace = self.trace.clone();
        let granted = self.granted.clone();
        engine.register_fn(
            "read_file",
            move |path: &str| -> Result<String, Box<EvalAltResult>> {
                if !granted.contains(&Permission::FileAccess) {
                    return Err(Self::denied(Permission::FileAccess));
                }
                let t = trace.lock().unwrap();
                // Reads return what the plugin wrote earlier, else a fixed
                // FASTA stub.
                Ok(t.files
                    .get(path)
                    .cloned()
                    .unwrap_or_else(|| ">mock\nACGTACGTAC\n".to_string()))
            },
        );
        let trace = self.trace.clone();
        let granted = self.granted.clone();
        engine.register_fn(
            "write_file",
            move |path: &str, content: &str| -> Result<(), Box<EvalAltResult>> {
                if !granted.contains(&Permission::FileAccess) {
                    return Err(Self::denied(Permission::FileAccess));
                }
                trace
                    .lock()
                    .unwrap()
                    .files
                    .insert(path.to_string(), content.to_string());
                Ok(())
            },
        );
    }

    fn register_network(&self, engine: &mut Engine) {
        for name in ["http_get", "fetch"] {
            let trace = self.trace.clone();
            let granted = self.granted.clone();
            engine.register_fn(
                name,
                move |url: &str| -> Result<String, Box<EvalAltResult>> {
                    if !granted.contains(&Permission::NetworkAccess) {
                        return Err(Self::denied(Permission::NetworkAccess));
                    }
                    trace.lock().unwrap().network.push(url.to_string());
                    Ok(format!(r#"{{"status":200,"url":"{url}"}}"#))
                },
            );
        }
        let trace = self.trace.clone();
        let granted = self.granted.clone();
        engine.register_fn(
            "http_post",
            move |url: &str, _body: &str| -> Result<String, Box<EvalAltResult>> {
                if !granted.contains(&Permission::NetworkAccess) {
                    return Err(Self::denied(Permission::NetworkAccess));
                }
                trace.lock().unwrap().network.push(url.to_string());
                Ok(format!(r#"{{"status":200,"url":"{url}"}}"#))
            },
        );
    }

    fn register_ui(&self, engine: &mut Engine) {
        let unary = ["ui_notify"];
        for name in unary {
            let trace = self.trace.clone();
            let granted = self.granted.clone();
            engine.register_fn(
                name,
                move |message: &str| -> Result<(), Box<EvalAltResult>> {
                    if !granted.contains(&Permission::UiAccess) {
                        return Err(Self::denied(Permission::UiAccess));
                    }
                    trace
                        .lock()
                        .unwrap()
                        .ui
                        .push(format!("{name}:{message}"));
                    Ok(())
                },
            );
        }
        let binary = [
            "ui_add_panel",
            "ui_add_menu",
            "ui_set_panel_html",
            "ui_set_panel_raw_html",
        ];
        for name in binary {
            let trace = self.trace.clone();
            let granted = self.granted.clone();
            engine.register_fn(
                name,
                move |target: &str, _content: &str| -> Result<(), Box<EvalAltResult>> {
                    if !granted.contains(&Permission::UiAccess) {
                        return Err(Self::denied(Permission::UiAccess));
                    }
                    trace.lock().unwrap().ui.push(format!("{name}:{target}"));
                    Ok(())
                },
            );
        }
    }

    fn register_data(&self, engine: &mut Engine) {
        // Data retrieval stubs carry no permission gate: the workbench always
        // exposes the loaded genome to plugins.
        engine.register_fn("data_genome", || -> rhai::Map {
            let mut genome = rhai::Map::new();
            genome.insert("id".into(), "mock-genome".into());
            genome.insert("name".into(), "Mock genome".into());
            genome.insert("length".into(), Dynamic::from(1000_i64));
            genome
        });
        engine.register_fn(
            "data_region",
            |chrom: &str, start: i64, end: i64| -> rhai::Map {
                let mut region = rhai::Map::new();
                region.insert("chrom".into(), chrom.into());
                region.insert("start".into(), Dynamic::from(start));
                region.insert("end".into(), Dynamic::from(end));
                region
            },
        );
        engine.register_fn("data_sequence", |_region: rhai::Map| -> String {
            "ACGTACGTAC".to_string()
        });
    }

    fn register_ai(&self, engine: &mut Engine) {
        let trace = self.trace.clone();
        let granted = self.granted.clone();
        engine.register_fn(
            "ai_register_function",
            move |name: &str, _callback: FnPtr| -> Result<(), Box<EvalAltResult>> {
                if !granted.contains(&Permission::AiAccess) {
                    return Err(Self::denied(Permission::AiAccess));
                }
                trace.lock().unwrap().ai_functions.push(name.to_string());
                Ok(())
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Trace accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Timers the plugin created and never cleared.
    pub fn active_timers(&self) -> usize {
        self.trace.lock().unwrap().timers.len()
    }

    /// Release every outstanding timer; returns how many were cleared.
    pub fn clear_all_timers(&self) -> usize {
        let mut t = self.trace.lock().unwrap();
        let count = t.timers.len();
        t.timers.clear();
        count
    }

    pub fn logs(&self) -> Vec<(&'static str, String)> {
        self.trace.lock().unwrap().logs.clone()
    }

    pub fn network_calls(&self) -> Vec<String> {
        self.trace.lock().unwrap().network.clone()
    }

    pub fn written_files(&self) -> HashMap<String, String> {
        self.trace.lock().unwrap().files.clone()
    }

    pub fn ui_events(&self) -> Vec<String> {
        self.trace.lock().unwrap().ui.clone()
    }

    pub fn ai_functions(&self) -> Vec<String> {
        self.trace.lock().unwrap().ai_functions.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
