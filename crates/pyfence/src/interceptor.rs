//! Import interceptor: hooks the host's module-resolution pipeline.
//!
//! RustPython funnels every module load — first-time or cached — through
//! `builtins.__import__`, so one rebound primitive covers both of the
//! observation duties:
//! - every import statement is attributed to its calling module (from the
//!   caller's `__name__` global) and reported to the engine, with a
//!   dependency-graph dedup check so repeat loads are not re-reported;
//! - after a successful first load of a target-matching module, the module is
//!   instrumented in place: source modules get their exports rewrapped through
//!   the wrapper factory (plus a containing-package edge for dotted names),
//!   foreign modules are added to the tracked set and shimmed by the profiler.
//!
//! Modules that were already loaded when the agent is installed are covered by
//! two one-shot sweeps over `sys.modules`: `rewrap_existing_targets` for
//! source modules and `mark_loaded_foreign_modules` for native/frozen ones.

use std::rc::Rc;
use std::sync::Arc;

use log::{debug, warn};
use rustpython_vm::{
    function::FuncArgs, AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::config::TargetSet;
use crate::engine::HookEngine;
use crate::profiler;
use crate::types::PolicyViolation;
use crate::vm::policy_violation_to_py;
use crate::wrap::{exception_text, WrapperFactory};

/// Where the real import primitive is stashed on first install, so reinstalls
/// keep delegating to the original rather than to a stale hook.
const SAVED_IMPORT_ATTR: &str = "__pyfence_original_import__";

/// Namespaces that stay un-shimmed even when tracked: rebinding their exports
/// would destabilize the interpreter itself.
const UNSHIMMED_NAMESPACES: &[&str] = &["sys", "builtins"];

/// Replace `builtins.__import__` with the observing/enforcing hook.
pub(crate) fn install_import_hook(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    engine: &Arc<HookEngine>,
    targets: &TargetSet,
) -> PyResult<()> {
    let original_import = if let Ok(saved) = vm.builtins.get_attr(SAVED_IMPORT_ATTR, vm) {
        saved
    } else {
        let real_original = vm.builtins.get_attr("__import__", vm)?;
        vm.builtins
            .set_attr(SAVED_IMPORT_ATTR, real_original.clone(), vm)?;
        real_original
    };

    // PyObjectRef is not Send+Sync but the closure runs within the VM thread
    // only.
    #[allow(clippy::arc_with_non_send_sync)]
    let original_import = Arc::new(original_import);
    let factory = Rc::clone(factory);
    let engine = Arc::clone(engine);
    let targets = targets.clone();

    let hook = vm.new_function(
        "__import__",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            // Python's __import__ signature:
            //   __import__(name, globals=None, locals=None, fromlist=(), level=0)
            let module_name: String = args
                .args
                .first()
                .and_then(|o| o.str(vm).ok())
                .map(|s| s.as_str().to_owned())
                .unwrap_or_default();
            let level: i64 = args
                .args
                .get(4)
                .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                .unwrap_or(0);

            let full_name = resolve_relative(vm, &args, &module_name, level);
            let parent = caller_module(vm, &args);

            // Report the edge once. Cached loads skip the resolver, so this is
            // the only place they become visible.
            if !engine.has_edge(parent.as_deref(), &full_name) {
                if let Err(violation) = engine.on_import(parent.as_deref(), &full_name) {
                    return Err(policy_violation_to_py(vm, &violation));
                }
            }

            let module = original_import.call(args, vm)?;

            // Instrumentation faults are logged and leave the module
            // untouched, but a denial on the containing-package edge escapes
            // exactly like the caller-edge denial above.
            if targets.matches(&full_name) {
                if let Err(violation) = instrument_loaded_module(vm, &factory, &engine, &full_name)
                {
                    return Err(policy_violation_to_py(vm, &violation));
                }
            }

            Ok(module)
        },
    );
    vm.builtins.set_attr("__import__", hook, vm)?;
    debug!("import hook installed");
    Ok(())
}

/// For relative imports (level > 0), resolve the full module path against the
/// caller's `__package__`.
fn resolve_relative(
    vm: &VirtualMachine,
    args: &FuncArgs,
    module_name: &str,
    level: i64,
) -> String {
    if level <= 0 {
        return module_name.to_string();
    }
    let package = args.args.get(1).and_then(|globals| {
        if vm.is_none(globals) {
            return None;
        }
        vm.call_method(globals, "get", (vm.ctx.new_str("__package__"),))
            .ok()
            .filter(|v| !vm.is_none(v))
            .and_then(|v| v.str(vm).ok())
            .map(|s| s.as_str().to_owned())
    });
    let Some(pkg) = package else {
        return module_name.to_string();
    };

    // Go up `level` levels from the package name.
    let base = if level > 1 {
        let parts: Vec<&str> = pkg.split('.').collect();
        let keep = parts.len().saturating_sub((level - 1) as usize);
        parts[..keep].join(".")
    } else {
        pkg
    };
    if module_name.is_empty() {
        base
    } else {
        format!("{base}.{module_name}")
    }
}

/// The importing module, from the caller's `__name__` global. `None` when the
/// import carries no globals (host-internal loads).
fn caller_module(vm: &VirtualMachine, args: &FuncArgs) -> Option<String> {
    let globals = args.args.get(1)?;
    if vm.is_none(globals) {
        return None;
    }
    vm.call_method(globals, "get", (vm.ctx.new_str("__name__"),))
        .ok()
        .filter(|v| !vm.is_none(v))
        .and_then(|v| v.str(vm).ok())
        .map(|s| s.as_str().to_owned())
}

/// Instrument a freshly loaded target module in place.
///
/// The only error that escapes is a policy denial on the containing-package
/// edge — that must abort the import. Wrapping and shimming failures are
/// logged and the affected exports left untouched.
fn instrument_loaded_module(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    engine: &Arc<HookEngine>,
    full_name: &str,
) -> Result<(), PolicyViolation> {
    let module = match lookup_sys_module(vm, full_name) {
        Ok(Some(module)) => module,
        Ok(None) => return Ok(()),
        Err(err) => {
            warn!(
                "could not look up {full_name}: {}",
                exception_text(vm, &err)
            );
            return Ok(());
        }
    };

    if is_source_module(vm, &module) {
        // The containing package depends on its submodule; top-level modules
        // are their own parent and record no edge.
        if let Some((package, _)) = full_name.rsplit_once('.') {
            if !engine.has_edge(Some(package), full_name) {
                engine.on_import(Some(package), full_name)?;
            }
        }
        if let Err(err) = factory.wrap_module_exports(vm, &module, full_name) {
            warn!(
                "failed to instrument {full_name}: {}",
                exception_text(vm, &err)
            );
        }
    } else {
        engine.track_foreign(full_name);
        if let Err(err) = profiler::install_native_shims(vm, factory, engine, &module, full_name) {
            warn!("failed to shim {full_name}: {}", exception_text(vm, &err));
        }
    }
    Ok(())
}

/// Fetch a module object from `sys.modules`, or `None` if absent.
fn lookup_sys_module(vm: &VirtualMachine, name: &str) -> PyResult<Option<PyObjectRef>> {
    let modules = vm.sys_module.get_attr("modules", vm)?;
    let module = vm.call_method(&modules, "get", (vm.ctx.new_str(name),))?;
    if vm.is_none(&module) {
        Ok(None)
    } else {
        Ok(Some(module))
    }
}

/// A module is source-level when it was executed from a `.py` file; native,
/// frozen, and built-in modules carry no usable `__file__`.
fn is_source_module(vm: &VirtualMachine, module: &PyObjectRef) -> bool {
    let Ok(file) = module.get_attr("__file__", vm) else {
        return false;
    };
    if vm.is_none(&file) {
        return false;
    }
    file.str(vm)
        .map(|s| s.as_str().ends_with(".py"))
        .unwrap_or(false)
}

/// One-shot bootstrap: rewrap exports of target modules that were already
/// loaded before the agent was installed.
pub(crate) fn rewrap_existing_targets(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    targets: &TargetSet,
) -> PyResult<()> {
    for name in loaded_module_names(vm)? {
        if !targets.matches(&name) {
            continue;
        }
        let Some(module) = lookup_sys_module(vm, &name)? else {
            continue;
        };
        if is_source_module(vm, &module) {
            if let Err(err) = factory.wrap_module_exports(vm, &module, &name) {
                warn!("failed to rewrap {name}: {}", exception_text(vm, &err));
            }
        }
    }
    Ok(())
}

/// One-shot bootstrap: mark every already-loaded foreign (native, frozen,
/// built-in) module as tracked, and shim the safe ones so their calls become
/// visible.
pub(crate) fn mark_loaded_foreign_modules(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    engine: &Arc<HookEngine>,
) -> PyResult<()> {
    for name in loaded_module_names(vm)? {
        let Some(module) = lookup_sys_module(vm, &name)? else {
            continue;
        };
        if is_source_module(vm, &module) {
            continue;
        }
        engine.track_foreign(&name);
        if UNSHIMMED_NAMESPACES.contains(&name.as_str()) || name.starts_with("_frozen_importlib") {
            continue;
        }
        if let Err(err) = profiler::install_native_shims(vm, factory, engine, &module, &name) {
            warn!("failed to shim {name}: {}", exception_text(vm, &err));
        }
    }
    Ok(())
}

fn loaded_module_names(vm: &VirtualMachine) -> PyResult<Vec<String>> {
    let modules = vm.sys_module.get_attr("modules", vm)?;
    let keys = vm.call_method(&modules, "keys", ())?;
    vm.extract_elements_with(&keys, |obj| String::try_from_object(vm, obj))
}
