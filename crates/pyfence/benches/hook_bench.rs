// crates/pyfence/benches/hook_bench.rs
//
// Two Criterion benchmark groups:
//   event_throughput    — engine cost per call/return pair on the hot path
//   allowlist_derivation — deriving the allowlist from a populated run

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pyfence::{CallArgs, HookEngine, Mode, ReturnSnapshot};

fn populated_engine(modules: usize, funcs: usize) -> HookEngine {
    let engine = HookEngine::new(Mode::Learn, Vec::new(), HashMap::new(), true);
    let args = CallArgs::default();
    for m in 0..modules {
        let module = format!("pkg.mod_{m}");
        engine
            .on_import(Some("__main__"), &module)
            .expect("learn mode never denies");
        for f in 0..funcs {
            let func = format!("f_{f}");
            engine.on_call(&module, &func, &args).expect("learn");
            engine.on_return(&module, &func, &ReturnSnapshot::value("int"));
        }
    }
    engine
}

fn event_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_throughput");

    group.bench_function("learn_call_return_pair", |b| {
        let engine = HookEngine::new(Mode::Learn, Vec::new(), HashMap::new(), true);
        let args = CallArgs::default();
        let result = ReturnSnapshot::value("int");
        b.iter(|| {
            engine
                .on_call(black_box("leaf"), black_box("f"), &args)
                .expect("learn");
            engine.on_return(black_box("leaf"), black_box("f"), &result);
        });
    });

    group.bench_function("enforce_allowed_call", |b| {
        let allowlist: HashMap<String, Vec<String>> =
            [("leaf".to_string(), vec!["f".to_string()])].into();
        let engine = HookEngine::new(Mode::Enforce, Vec::new(), allowlist, true);
        let args = CallArgs::default();
        b.iter(|| {
            engine
                .on_call(black_box("leaf"), black_box("f"), &args)
                .expect("allowed");
        });
    });

    group.finish();
}

fn allowlist_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allowlist_derivation");

    group.bench_function("derive_50x20", |b| {
        let engine = populated_engine(50, 20);
        b.iter(|| black_box(engine.derive_allowlist()));
    });

    group.finish();
}

criterion_group!(benches, event_throughput, allowlist_derivation);
criterion_main!(benches);
