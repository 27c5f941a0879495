//! Scenario tests that drive the hook engine with literal event streams,
//! without spinning up an interpreter. These pin down the policy semantics,
//! the artifact shapes, and the learn -> enforce round-trip.

use std::collections::HashMap;

use pyfence::{CallArgs, HookEngine, Mode, PolicyViolation, ReturnSnapshot};

fn learn_engine() -> HookEngine {
    HookEngine::new(Mode::Learn, Vec::new(), HashMap::new(), true)
}

fn enforce_engine(allowlist: HashMap<String, Vec<String>>) -> HookEngine {
    HookEngine::new(Mode::Enforce, Vec::new(), allowlist, true)
}

/// Replay the event stream of a script that imports `leaf` and calls
/// `leaf.f()` once.
fn replay_leaf_run(engine: &HookEngine) -> Result<(), PolicyViolation> {
    engine.on_import(Some("__main__"), "leaf")?;
    engine.on_call("leaf", "f", &CallArgs::default())?;
    engine.on_return("leaf", "f", &ReturnSnapshot::value("int"));
    Ok(())
}

// ── Learn-mode artifacts ──────────────────────────────────────────────────────

#[test]
fn test_learn_run_produces_expected_artifacts() {
    let engine = learn_engine();
    replay_leaf_run(&engine).expect("learn mode never denies");

    let deps = engine.dependency_snapshot();
    assert_eq!(deps["__main__"], vec!["leaf"]);

    let events = engine.event_snapshot();
    assert!(events["leaf"].contains(&"call:f".to_string()));
    assert!(events["leaf"].contains(&"return:f".to_string()));
    assert!(events["__main__"].contains(&"import:leaf".to_string()));

    let allow = engine.derive_allowlist();
    assert_eq!(allow["__main__"], vec!["leaf"]);
    assert_eq!(allow["leaf"], vec!["f"]);
}

#[test]
fn test_learn_reports_round_trip_through_disk() {
    let engine = learn_engine();
    replay_leaf_run(&engine).expect("learn mode never denies");

    let dir = tempfile::tempdir().expect("tempdir");
    engine.write_reports(dir.path()).expect("write reports");

    let deps: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("dependencies.json")).expect("read"),
    )
    .expect("parse");
    assert_eq!(deps["dependencies"]["__main__"][0], "leaf");

    let events: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("events.json")).expect("read"),
    )
    .expect("parse");
    assert_eq!(events["leaf"]["call:f"], true);
    assert_eq!(events["leaf"]["return:f"], true);

    let allow = pyfence::load_allowlist(&dir.path().join("allowlist.json")).expect("reload");
    assert_eq!(allow["__main__"], vec!["leaf"]);
    assert_eq!(allow["leaf"], vec!["f"]);
}

#[test]
fn test_enforce_mode_writes_no_reports() {
    let engine = enforce_engine(HashMap::new());
    let dir = tempfile::tempdir().expect("tempdir");
    engine.write_reports(dir.path()).expect("no-op");
    assert!(!dir.path().join("dependencies.json").exists());
    assert!(!dir.path().join("events.json").exists());
    assert!(!dir.path().join("allowlist.json").exists());
}

// ── Round-trip: learn then enforce (P4) ───────────────────────────────────────

#[test]
fn test_learned_allowlist_admits_the_same_run() {
    let learner = learn_engine();
    replay_leaf_run(&learner).expect("learn mode never denies");

    let allowlist: HashMap<String, Vec<String>> = learner.derive_allowlist().into_iter().collect();
    let enforcer = enforce_engine(allowlist);
    replay_leaf_run(&enforcer).expect("learned allowlist must admit the identical run");
}

// ── Strictness: removing a used name forces a denial (P5) ─────────────────────

#[test]
fn test_removing_used_call_name_forces_denial() {
    let learner = learn_engine();
    replay_leaf_run(&learner).expect("learn mode never denies");

    let mut allowlist: HashMap<String, Vec<String>> =
        learner.derive_allowlist().into_iter().collect();
    allowlist.insert("leaf".to_string(), Vec::new());

    let enforcer = enforce_engine(allowlist);
    let denial = replay_leaf_run(&enforcer).expect_err("pruned allowlist must deny");
    assert_eq!(
        denial,
        PolicyViolation::CallDenied {
            module: "leaf".to_string(),
            func: "f".to_string(),
        }
    );
}

#[test]
fn test_package_edge_is_policed_independently_of_caller_edge() {
    // A submodule import produces two edges: caller -> name and
    // containing-package -> name. Allowlisting only the caller edge must not
    // admit the import.
    let mut allowlist = HashMap::new();
    allowlist.insert("__main__".to_string(), vec!["pkg.sub".to_string()]);
    allowlist.insert("pkg".to_string(), Vec::new());

    let engine = enforce_engine(allowlist);
    engine
        .on_import(Some("__main__"), "pkg.sub")
        .expect("caller edge is allowlisted");
    let denial = engine
        .on_import(Some("pkg"), "pkg.sub")
        .expect_err("package edge must deny");
    assert_eq!(
        denial,
        PolicyViolation::ImportDenied {
            parent: "pkg".to_string(),
            name: "pkg.sub".to_string(),
        }
    );
}

#[test]
fn test_removing_used_import_name_forces_denial() {
    let learner = learn_engine();
    replay_leaf_run(&learner).expect("learn mode never denies");

    let mut allowlist: HashMap<String, Vec<String>> =
        learner.derive_allowlist().into_iter().collect();
    allowlist.insert("__main__".to_string(), Vec::new());

    let enforcer = enforce_engine(allowlist);
    let denial = replay_leaf_run(&enforcer).expect_err("pruned allowlist must deny");
    assert_eq!(
        denial,
        PolicyViolation::ImportDenied {
            parent: "__main__".to_string(),
            name: "leaf".to_string(),
        }
    );
}

// ── Missing return events are tolerated ───────────────────────────────────────

#[test]
fn test_exceptional_exit_leaves_call_without_return() {
    // A wrapped function that raises emits call: but no return:. The allowlist
    // still lists the call name, so a retry under enforcement is admitted.
    let engine = learn_engine();
    engine.on_import(Some("__main__"), "leaf").expect("import");
    engine
        .on_call("leaf", "boom", &CallArgs::default())
        .expect("call");
    // no on_return: the callable raised

    let events = engine.event_snapshot();
    assert!(events["leaf"].contains(&"call:boom".to_string()));
    assert!(!events["leaf"].contains(&"return:boom".to_string()));

    let allow = engine.derive_allowlist();
    assert!(allow["leaf"].contains(&"boom".to_string()));
}
