//! Native-call profiler: surfaces entries into and exits from foreign-binary
//! functions, for which source-level wrapping is impossible.
//!
//! The host exposes no per-event profiling callback, so the profiler installs
//! one itself: each builtin-function export of a tracked foreign module is
//! rebound with a shim whose entry/exit callbacks forward through
//! [`HookEngine::native_profile_event`]. The engine applies the reentrancy and
//! tracked-module filters; the shim only delegates. Arguments and return
//! values of foreign calls are not observable — events carry the empty
//! argument snapshot and the unit sentinel, and only name-level visibility is
//! guaranteed.

use std::rc::Rc;
use std::sync::Arc;

use rustpython_vm::{function::FuncArgs, AsObject, PyObjectRef, PyResult, VirtualMachine};

use crate::engine::HookEngine;
use crate::types::{NativeCallable, ProfileEvent};
use crate::vm::policy_violation_to_py;
use crate::wrap::{is_builtin_function, module_export_names, WrapperFactory};

/// Rebind each builtin-function export of `module` with a profiling shim.
///
/// Shims are memoized in the factory's cache, so shimming the same module
/// twice rebinds the same objects.
pub(crate) fn install_native_shims(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    engine: &Arc<HookEngine>,
    module: &PyObjectRef,
    module_name: &str,
) -> PyResult<()> {
    for name in module_export_names(vm, module)? {
        if name.starts_with("__") {
            continue;
        }
        let name_py = vm.ctx.new_str(name.as_str());
        let Ok(value) = module.get_attr(&name_py, vm) else {
            continue;
        };
        if !is_builtin_function(vm, &value) || factory.is_proxy(&value) {
            continue;
        }

        let shim = if let Some(existing) = factory.cached(value.get_id()) {
            existing
        } else {
            let original_id = value.get_id();
            let shim = make_shim(vm, factory, engine, &value, module_name, &name)?;
            factory.remember(original_id, shim.clone());
            shim
        };
        // A namespace that refuses the rebind keeps its original export.
        let _ = module.set_attr(&name_py, shim, vm);
    }
    Ok(())
}

fn make_shim(
    vm: &VirtualMachine,
    factory: &Rc<WrapperFactory>,
    engine: &Arc<HookEngine>,
    original: &PyObjectRef,
    module_name: &str,
    func_name: &str,
) -> PyResult<PyObjectRef> {
    let descriptor = NativeCallable {
        module: module_name.to_string(),
        name: func_name.to_string(),
    };

    let entry_engine = Arc::clone(engine);
    let entry_descriptor = descriptor.clone();
    let notify_entry = vm.new_function(
        "profile_entry",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            if let Err(violation) =
                entry_engine.native_profile_event(ProfileEvent::Entry, &entry_descriptor)
            {
                return Err(policy_violation_to_py(vm, &violation));
            }
            Ok(vm.ctx.none())
        },
    );

    let exit_engine = Arc::clone(engine);
    let notify_exit = vm.new_function(
        "profile_exit",
        // Exceptional foreign exits never reach this callback, so no return
        // record is produced for them.
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let _ = exit_engine.native_profile_event(ProfileEvent::Exit, &descriptor);
            Ok(vm.ctx.none())
        },
    );

    factory.build_proxy(vm, original, notify_entry.into(), notify_exit.into(), false)
}
