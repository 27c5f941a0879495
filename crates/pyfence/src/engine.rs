//! Event/policy engine: the single sink for import, call, and return events.
//!
//! The [`HookEngine`] owns all graph/event state for a run. Every entry point:
//! 1. Takes the thread-local reentrancy guard; if the flag is already set the
//!    call is a no-op. This is the only thing preventing the agent from
//!    observing its own activity (the native shims would otherwise recurse).
//! 2. Records into the dependency graph / event set under one mutex, so the
//!    "already has edge" check and the event dedup appear atomic to concurrent
//!    host threads.
//! 3. Applies mode policy. In enforce mode a disallowed import or call returns
//!    a [`PolicyViolation`] that the caller must surface to the host — these
//!    must escape, unlike analysis faults.
//! 4. Fans out to the registered analyses under a failure barrier: a callback
//!    error is logged and swallowed, and the engine continues as if the
//!    analysis had accepted the event.
//!
//! At shutdown (learn mode only) [`HookEngine::write_reports`] emits the
//! dependencies, events, and derived-allowlist artifacts.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use log::warn;

use crate::analysis::Analysis;
use crate::report;
use crate::types::{
    CallArgs, Mode, NativeCallable, PolicyViolation, ProfileEvent, ReturnSnapshot, ROOT_MODULE,
};

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard for the thread-local reentrancy flag.
///
/// The flag is cleared on drop, which covers every exit path including error
/// returns.
pub(crate) struct ReentryGuard {
    _private: (),
}

impl ReentryGuard {
    /// Take the guard, or `None` if this thread is already inside the engine.
    pub(crate) fn try_enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(ReentryGuard { _private: () })
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

#[derive(Default)]
struct EngineState {
    dep_graph: BTreeMap<String, BTreeSet<String>>,
    events: BTreeMap<String, BTreeSet<String>>,
}

impl EngineState {
    fn record_event(&mut self, module: &str, tag: String) {
        let module = if module.is_empty() { ROOT_MODULE } else { module };
        self.events.entry(module.to_string()).or_default().insert(tag);
    }
}

pub struct HookEngine {
    mode: Mode,
    log_events: bool,
    allowlist: HashMap<String, HashSet<String>>,
    analyses: Vec<Box<dyn Analysis>>,
    state: Mutex<EngineState>,
    tracked_foreign: Mutex<HashSet<String>>,
}

impl HookEngine {
    pub fn new(
        mode: Mode,
        analyses: Vec<Box<dyn Analysis>>,
        allowlist: HashMap<String, Vec<String>>,
        log_events: bool,
    ) -> Self {
        let allowlist = allowlist
            .into_iter()
            .map(|(module, names)| (module, names.into_iter().collect()))
            .collect();
        HookEngine {
            mode,
            log_events,
            allowlist,
            analyses,
            state: Mutex::new(EngineState::default()),
            tracked_foreign: Mutex::new(HashSet::new()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    // ── Event entry points ────────────────────────────────────────────────────

    /// Record the edge `parent -> name` (with `parent` defaulting to
    /// `__main__`), apply import policy, and fan out.
    pub fn on_import(&self, parent: Option<&str>, name: &str) -> Result<(), PolicyViolation> {
        let Some(_guard) = ReentryGuard::try_enter() else {
            return Ok(());
        };
        self.import_inner(parent, name)
    }

    /// Record `call:{func}` (learn) or check the allowlist (enforce), then fan
    /// out.
    pub fn on_call(
        &self,
        module: &str,
        func: &str,
        args: &CallArgs,
    ) -> Result<(), PolicyViolation> {
        let Some(_guard) = ReentryGuard::try_enter() else {
            return Ok(());
        };
        self.call_inner(module, func, args)
    }

    /// Record `return:{func}` (learn) and fan out. No policy applies.
    pub fn on_return(&self, module: &str, func: &str, result: &ReturnSnapshot) {
        let Some(_guard) = ReentryGuard::try_enter() else {
            return;
        };
        self.return_inner(module, func, result);
    }

    /// Entry point for the native-call profiler shims.
    ///
    /// Both the reentrancy flag and the foreign-module filter must pass;
    /// events for untracked modules are dropped. Entries surface as calls with
    /// the empty-argument snapshot (so call policy applies), exits as returns
    /// carrying the unit sentinel.
    pub fn native_profile_event(
        &self,
        event: ProfileEvent,
        callable: &NativeCallable,
    ) -> Result<(), PolicyViolation> {
        let Some(_guard) = ReentryGuard::try_enter() else {
            return Ok(());
        };
        if !self.is_tracked(&callable.module) {
            return Ok(());
        }
        match event {
            ProfileEvent::Entry => {
                self.call_inner(&callable.module, &callable.name, &CallArgs::default())
            }
            ProfileEvent::Exit => {
                self.return_inner(&callable.module, &callable.name, &ReturnSnapshot::Unit);
                Ok(())
            }
        }
    }

    // ── Guard-free internals ──────────────────────────────────────────────────

    fn import_inner(&self, parent: Option<&str>, name: &str) -> Result<(), PolicyViolation> {
        let parent_mod = parent.unwrap_or(ROOT_MODULE);
        {
            let mut state = self.state.lock().expect("HookEngine mutex poisoned");
            if parent_mod != name {
                state
                    .dep_graph
                    .entry(parent_mod.to_string())
                    .or_default()
                    .insert(name.to_string());
            }
            if self.mode.is_learn() && self.log_events {
                state.record_event(parent_mod, format!("import:{name}"));
            }
        }

        if self.mode.is_enforce() {
            if let Some(parent) = parent {
                if !self.allowed(parent, name) {
                    return Err(PolicyViolation::ImportDenied {
                        parent: parent.to_string(),
                        name: name.to_string(),
                    });
                }
            }
        }

        for analysis in &self.analyses {
            if let Err(err) = analysis.on_import(parent, name) {
                warn!("analysis {} failed in on_import: {err}", analysis.name());
            }
        }
        Ok(())
    }

    fn call_inner(&self, module: &str, func: &str, args: &CallArgs) -> Result<(), PolicyViolation> {
        if self.mode.is_learn() {
            if self.log_events {
                let mut state = self.state.lock().expect("HookEngine mutex poisoned");
                state.record_event(module, format!("call:{func}"));
            }
        } else if !self.allowed(module, func) {
            return Err(PolicyViolation::CallDenied {
                module: module.to_string(),
                func: func.to_string(),
            });
        }

        for analysis in &self.analyses {
            if let Err(err) = analysis.on_call(module, func, args) {
                warn!("analysis {} failed in on_call: {err}", analysis.name());
            }
        }
        Ok(())
    }

    fn return_inner(&self, module: &str, func: &str, result: &ReturnSnapshot) {
        if self.mode.is_learn() && self.log_events {
            let mut state = self.state.lock().expect("HookEngine mutex poisoned");
            state.record_event(module, format!("return:{func}"));
        }

        for analysis in &self.analyses {
            if let Err(err) = analysis.on_return(module, func, result) {
                warn!("analysis {} failed in on_return: {err}", analysis.name());
            }
        }
    }

    // ── Graph / tracking queries ──────────────────────────────────────────────

    /// Whether the dependency graph already contains `parent -> name`. Used by
    /// the import interceptor to avoid re-reporting cached loads.
    pub fn has_edge(&self, parent: Option<&str>, name: &str) -> bool {
        let parent_mod = parent.unwrap_or(ROOT_MODULE);
        let state = self.state.lock().expect("HookEngine mutex poisoned");
        state
            .dep_graph
            .get(parent_mod)
            .is_some_and(|children| children.contains(name))
    }

    /// Mark `module` as implemented in foreign binary form.
    pub fn track_foreign(&self, module: &str) {
        self.tracked_foreign
            .lock()
            .expect("HookEngine mutex poisoned")
            .insert(module.to_string());
    }

    pub fn is_tracked(&self, module: &str) -> bool {
        self.tracked_foreign
            .lock()
            .expect("HookEngine mutex poisoned")
            .contains(module)
    }

    fn allowed(&self, module: &str, name: &str) -> bool {
        self.allowlist
            .get(module)
            .is_some_and(|names| names.contains(name))
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    /// Sorted snapshot of the dependency graph.
    pub fn dependency_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock().expect("HookEngine mutex poisoned");
        state
            .dep_graph
            .iter()
            .map(|(parent, children)| (parent.clone(), children.iter().cloned().collect()))
            .collect()
    }

    /// Sorted snapshot of the event set.
    pub fn event_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock().expect("HookEngine mutex poisoned");
        state
            .events
            .iter()
            .map(|(module, tags)| (module.clone(), tags.iter().cloned().collect()))
            .collect()
    }

    /// Derive the allowlist: each parent's sorted child set from the graph,
    /// plus every name observed as `call:<n>` in that module's event set,
    /// sorted and deduplicated per module.
    pub fn derive_allowlist(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock().expect("HookEngine mutex poisoned");
        let mut allow: BTreeMap<String, BTreeSet<String>> = state
            .dep_graph
            .iter()
            .map(|(parent, children)| (parent.clone(), children.clone()))
            .collect();
        for (module, tags) in &state.events {
            for tag in tags {
                if let Some(func) = tag.strip_prefix("call:") {
                    allow
                        .entry(module.clone())
                        .or_default()
                        .insert(func.to_string());
                }
            }
        }
        allow
            .into_iter()
            .map(|(module, names)| (module, names.into_iter().collect()))
            .collect()
    }

    /// Write the dependencies, events, and allowlist artifacts into `outdir`.
    /// No-op in enforce mode.
    pub fn write_reports(&self, outdir: &Path) -> std::io::Result<()> {
        if self.mode.is_enforce() {
            return Ok(());
        }
        std::fs::create_dir_all(outdir)?;
        report::write_dependencies(&outdir.join("dependencies.json"), &self.dependency_snapshot())?;
        report::write_events(&outdir.join("events.json"), &self.event_snapshot())?;
        report::write_allowlist(&outdir.join("allowlist.json"), &self.derive_allowlist())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn learn_engine() -> HookEngine {
        HookEngine::new(Mode::Learn, Vec::new(), HashMap::new(), true)
    }

    fn enforce_engine(allowlist: &[(&str, &[&str])]) -> HookEngine {
        let allowlist = allowlist
            .iter()
            .map(|(module, names)| {
                (
                    module.to_string(),
                    names.iter().map(|n| n.to_string()).collect(),
                )
            })
            .collect();
        HookEngine::new(Mode::Enforce, Vec::new(), allowlist, true)
    }

    // ── Learn-mode recording ──────────────────────────────────────────────────

    #[test]
    fn test_learn_records_edge_and_import_event() {
        let engine = learn_engine();
        engine.on_import(Some("__main__"), "leaf").expect("import");

        let deps = engine.dependency_snapshot();
        assert_eq!(deps["__main__"], vec!["leaf"]);
        let events = engine.event_snapshot();
        assert_eq!(events["__main__"], vec!["import:leaf"]);
    }

    #[test]
    fn test_missing_parent_defaults_to_root() {
        let engine = learn_engine();
        engine.on_import(None, "leaf").expect("import");
        assert!(engine.has_edge(None, "leaf"));
        assert!(engine.has_edge(Some("__main__"), "leaf"));
    }

    #[test]
    fn test_self_edge_is_not_recorded() {
        let engine = learn_engine();
        engine.on_import(Some("pkg"), "pkg").expect("import");
        assert!(!engine.has_edge(Some("pkg"), "pkg"));
    }

    #[test]
    fn test_events_deduplicate_within_a_module() {
        let engine = learn_engine();
        let args = CallArgs::default();
        engine.on_call("leaf", "f", &args).expect("call");
        engine.on_call("leaf", "f", &args).expect("call");
        engine.on_return("leaf", "f", &ReturnSnapshot::value("int"));

        let events = engine.event_snapshot();
        assert_eq!(events["leaf"], vec!["call:f", "return:f"]);
    }

    #[test]
    fn test_no_log_suppresses_events_but_keeps_graph() {
        let engine = HookEngine::new(Mode::Learn, Vec::new(), HashMap::new(), false);
        engine.on_import(Some("__main__"), "leaf").expect("import");
        engine
            .on_call("leaf", "f", &CallArgs::default())
            .expect("call");

        assert!(engine.event_snapshot().is_empty());
        assert_eq!(engine.dependency_snapshot()["__main__"], vec!["leaf"]);
    }

    // ── Enforce-mode policy ───────────────────────────────────────────────────

    #[test]
    fn test_enforce_allows_listed_import() {
        let engine = enforce_engine(&[("__main__", &["leaf"])]);
        assert!(engine.on_import(Some("__main__"), "leaf").is_ok());
    }

    #[test]
    fn test_enforce_denies_unlisted_import_naming_the_edge() {
        let engine = enforce_engine(&[("__main__", &[])]);
        let err = engine
            .on_import(Some("__main__"), "forbidden")
            .expect_err("should deny");
        assert_eq!(
            err,
            PolicyViolation::ImportDenied {
                parent: "__main__".to_string(),
                name: "forbidden".to_string(),
            }
        );
    }

    #[test]
    fn test_enforce_skips_policy_for_rootless_import() {
        // No parent module means no allowlist row to check against.
        let engine = enforce_engine(&[]);
        assert!(engine.on_import(None, "anything").is_ok());
    }

    #[test]
    fn test_enforce_denies_unlisted_call() {
        let engine = enforce_engine(&[("__main__", &["leaf"]), ("leaf", &[])]);
        let err = engine
            .on_call("leaf", "f", &CallArgs::default())
            .expect_err("should deny");
        assert_eq!(
            err,
            PolicyViolation::CallDenied {
                module: "leaf".to_string(),
                func: "f".to_string(),
            }
        );
    }

    #[test]
    fn test_enforce_denies_call_in_unknown_module() {
        let engine = enforce_engine(&[]);
        assert!(engine.on_call("leaf", "f", &CallArgs::default()).is_err());
    }

    #[test]
    fn test_enforce_records_no_events() {
        let engine = enforce_engine(&[("__main__", &["leaf"]), ("leaf", &["f"])]);
        engine.on_import(Some("__main__"), "leaf").expect("import");
        engine
            .on_call("leaf", "f", &CallArgs::default())
            .expect("call");
        engine.on_return("leaf", "f", &ReturnSnapshot::Unit);
        assert!(engine.event_snapshot().is_empty());
    }

    #[test]
    fn test_edge_recorded_before_denial() {
        // The graph is append-only observational state; insertion happens even
        // when policy subsequently rejects the edge.
        let engine = enforce_engine(&[]);
        let _ = engine.on_import(Some("__main__"), "forbidden");
        assert!(engine.has_edge(Some("__main__"), "forbidden"));
    }

    // ── Analysis barrier (P2) ─────────────────────────────────────────────────

    struct FailingAnalysis {
        calls: Arc<AtomicUsize>,
    }

    impl Analysis for FailingAnalysis {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_call(&self, _: &str, _: &str, _: &CallArgs) -> Result<(), AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AnalysisError("boom".to_string()))
        }

        fn on_import(&self, _: Option<&str>, _: &str) -> Result<(), AnalysisError> {
            Err(AnalysisError("boom".to_string()))
        }
    }

    #[test]
    fn test_analysis_errors_are_swallowed_and_state_unchanged() {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = FailingAnalysis {
            calls: Arc::clone(&calls),
        };
        let with_failing = HookEngine::new(
            Mode::Learn,
            vec![Box::new(failing)],
            HashMap::new(),
            true,
        );
        let without = learn_engine();

        for engine in [&with_failing, &without] {
            engine.on_import(Some("__main__"), "leaf").expect("import");
            engine
                .on_call("leaf", "f", &CallArgs::default())
                .expect("call");
            engine.on_return("leaf", "f", &ReturnSnapshot::Unit);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1, "analysis was invoked");
        assert_eq!(with_failing.dependency_snapshot(), without.dependency_snapshot());
        assert_eq!(with_failing.event_snapshot(), without.event_snapshot());
    }

    // ── Reentrancy (P7) ───────────────────────────────────────────────────────

    #[test]
    fn test_reentry_guard_is_exclusive_per_thread() {
        let first = ReentryGuard::try_enter().expect("first enter");
        assert!(ReentryGuard::try_enter().is_none(), "nested enter must fail");
        drop(first);
        assert!(ReentryGuard::try_enter().is_some(), "flag must clear on drop");
    }

    #[test]
    fn test_engine_is_inert_while_flag_held() {
        let engine = learn_engine();
        let guard = ReentryGuard::try_enter().expect("enter");
        engine.on_import(Some("__main__"), "leaf").expect("no-op");
        engine
            .on_call("leaf", "f", &CallArgs::default())
            .expect("no-op");
        engine.on_return("leaf", "f", &ReturnSnapshot::Unit);
        drop(guard);

        assert!(engine.dependency_snapshot().is_empty());
        assert!(engine.event_snapshot().is_empty());
    }

    #[test]
    fn test_enforce_is_permissive_while_flag_held() {
        // A reentrant call must be a no-op, not a denial: the engine's own
        // activity is never policed.
        let engine = enforce_engine(&[]);
        let guard = ReentryGuard::try_enter().expect("enter");
        assert!(engine.on_call("leaf", "f", &CallArgs::default()).is_ok());
        drop(guard);
    }

    // ── Native profiler filter ────────────────────────────────────────────────

    #[test]
    fn test_native_events_for_untracked_module_are_dropped() {
        let engine = learn_engine();
        let callable = NativeCallable {
            module: "fastmath".to_string(),
            name: "sqrt".to_string(),
        };
        engine
            .native_profile_event(ProfileEvent::Entry, &callable)
            .expect("entry");
        assert!(engine.event_snapshot().is_empty());
    }

    #[test]
    fn test_native_events_for_tracked_module_carry_sentinels() {
        let engine = learn_engine();
        engine.track_foreign("fastmath");
        let callable = NativeCallable {
            module: "fastmath".to_string(),
            name: "sqrt".to_string(),
        };
        engine
            .native_profile_event(ProfileEvent::Entry, &callable)
            .expect("entry");
        engine
            .native_profile_event(ProfileEvent::Exit, &callable)
            .expect("exit");

        let events = engine.event_snapshot();
        assert_eq!(events["fastmath"], vec!["call:sqrt", "return:sqrt"]);
    }

    #[test]
    fn test_native_entry_is_policed_in_enforce_mode() {
        let engine = enforce_engine(&[]);
        engine.track_foreign("fastmath");
        let callable = NativeCallable {
            module: "fastmath".to_string(),
            name: "sqrt".to_string(),
        };
        let err = engine
            .native_profile_event(ProfileEvent::Entry, &callable)
            .expect_err("should deny");
        assert!(matches!(err, PolicyViolation::CallDenied { .. }));
    }

    // ── Allowlist derivation ──────────────────────────────────────────────────

    #[test]
    fn test_derive_allowlist_unions_children_and_calls() {
        let engine = learn_engine();
        engine.on_import(Some("__main__"), "leaf").expect("import");
        engine
            .on_call("leaf", "f", &CallArgs::default())
            .expect("call");
        engine.on_return("leaf", "f", &ReturnSnapshot::value("int"));
        engine
            .on_call("__main__", "main", &CallArgs::default())
            .expect("call");

        let allow = engine.derive_allowlist();
        assert_eq!(allow["__main__"], vec!["leaf", "main"]);
        assert_eq!(allow["leaf"], vec!["f"]);
    }

    #[test]
    fn test_derive_allowlist_sorted_and_deduped() {
        let engine = learn_engine();
        engine.on_import(Some("__main__"), "b").expect("import");
        engine.on_import(Some("__main__"), "a").expect("import");
        // "a" both imported and called from __main__: must appear once.
        engine
            .on_call("__main__", "a", &CallArgs::default())
            .expect("call");

        let allow = engine.derive_allowlist();
        assert_eq!(allow["__main__"], vec!["a", "b"]);
    }

    // ── Concurrency ───────────────────────────────────────────────────────────

    #[test]
    fn test_concurrent_recording_no_lost_edges() {
        let engine = Arc::new(learn_engine());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for j in 0..16 {
                        let name = format!("mod_{i}_{j}");
                        engine.on_import(Some("__main__"), &name).expect("import");
                        engine
                            .on_call(&name, "f", &CallArgs::default())
                            .expect("call");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should not panic");
        }
        assert_eq!(engine.dependency_snapshot()["__main__"].len(), 64);
    }
}
