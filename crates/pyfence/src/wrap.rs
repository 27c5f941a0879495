//! Wrapper factory: transparently re-binds the exported callables of
//! instrumented modules with proxies that emit call/return events.
//!
//! Proxies are Python-level closures produced by the frozen
//! `_pyfence_support` module, with the two notification callbacks injected as
//! Rust native functions. Building the proxy in Python keeps the pieces the
//! host cares about intact: proxies are real function objects (descriptors,
//! so method binding works), the suspending variant is a real `async def` (so
//! the host scheduler still sees a coroutine function), and
//! `__name__`/`__qualname__`/`__doc__`/`__wrapped__` are carried over from the
//! original.
//!
//! Methods of exported classes are not wrapped eagerly: each directly-defined
//! method is replaced by a lazy descriptor that resolves to the wrapped proxy
//! on first access through the class, leaving class identity and descriptor
//! semantics untouched.
//!
//! Primitives, module objects, and foreign (builtin) callables are never
//! wrapped here; foreign callables belong to the native-call profiler, which
//! reuses this factory's proxy builder with its own notification callbacks.
//!
//! The memo table `original-id -> proxy` is a bounded LRU: re-wrapping the
//! same callable yields the same proxy object, and evicted entries release
//! their proxies together with the originals. Capacity comes from
//! `PYFENCE_WRAP_CACHE_SIZE` (default 1024, clamped to at least 1).

use std::cell::RefCell;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::sync::Arc;

use log::warn;
use lru::LruCache;
use rustpython_vm::{
    function::FuncArgs, AsObject, PyObjectRef, PyResult, TryFromObject, VirtualMachine,
};

use crate::engine::HookEngine;
use crate::types::{CallArgs, ReturnSnapshot};
use crate::vm::{import_support_module, policy_violation_to_py};

// Code-object flag bits marking suspending callables.
const CO_COROUTINE: i64 = 0x0080;
const CO_ASYNC_GENERATOR: i64 = 0x0200;

const DEFAULT_CACHE_CAPACITY: usize = 1024;

pub(crate) struct WrapperFactory {
    engine: Arc<HookEngine>,
    cache: RefCell<LruCache<usize, PyObjectRef>>,
    proxy_ids: RefCell<HashSet<usize>>,
    callable_proxy: PyObjectRef,
    suspending_proxy: PyObjectRef,
    lazy_method: PyObjectRef,
}

impl WrapperFactory {
    /// Build the factory, importing the frozen support module. Must run before
    /// the import primitive is rebound.
    pub(crate) fn new(vm: &VirtualMachine, engine: Arc<HookEngine>) -> PyResult<Rc<Self>> {
        let support = import_support_module(vm)?;
        let capacity = std::env::var("PYFENCE_WRAP_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CACHE_CAPACITY)
            .max(1);
        Ok(Rc::new(WrapperFactory {
            engine,
            cache: RefCell::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("capacity >= 1"),
            )),
            proxy_ids: RefCell::new(HashSet::new()),
            callable_proxy: support.get_attr("callable_proxy", vm)?,
            suspending_proxy: support.get_attr("suspending_proxy", vm)?,
            lazy_method: support.get_attr("lazy_method", vm)?,
        }))
    }

    /// Record `original -> proxy` and remember the proxy's identity.
    pub(crate) fn remember(&self, original_id: usize, proxy: PyObjectRef) {
        self.proxy_ids.borrow_mut().insert(proxy.get_id());
        self.cache.borrow_mut().put(original_id, proxy);
    }

    /// Previously produced proxy for `original_id`, if still cached.
    pub(crate) fn cached(&self, original_id: usize) -> Option<PyObjectRef> {
        self.cache.borrow_mut().get(&original_id).cloned()
    }

    /// Whether `value` is one of our proxies.
    pub(crate) fn is_proxy(&self, value: &PyObjectRef) -> bool {
        self.proxy_ids.borrow().contains(&value.get_id())
    }

    // ── Module-level wrapping ─────────────────────────────────────────────────

    /// Re-bind every non-dunder export of `module` through [`Self::wrap_value`],
    /// in place. A failure to wrap one export is logged and that export is left
    /// untouched.
    pub(crate) fn wrap_module_exports(
        self: &Rc<Self>,
        vm: &VirtualMachine,
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
            match self.wrap_value(vm, &name, value.clone(), module_name) {
                Ok(wrapped) => {
                    if !wrapped.is(&value) {
                        if let Err(err) = module.set_attr(&name_py, wrapped, vm) {
                            warn!(
                                "could not rebind {module_name}.{name}: {}",
                                exception_text(vm, &err)
                            );
                        }
                    }
                }
                Err(err) => {
                    // Leave the export unwrapped rather than replaced.
                    warn!(
                        "could not wrap {module_name}.{name}: {}",
                        exception_text(vm, &err)
                    );
                }
            }
        }
        Ok(())
    }

    /// Wrap one exported value. Returns the value unchanged whenever it is not
    /// a wrappable callable (primitives, modules, foreign callables, classes
    /// from other modules, anything already wrapped).
    pub(crate) fn wrap_value(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        name: &str,
        value: PyObjectRef,
        module_name: &str,
    ) -> PyResult<PyObjectRef> {
        if is_primitive(vm, &value) || is_module(vm, &value) {
            return Ok(value);
        }
        if self.is_proxy(&value) || has_back_reference(vm, &value) {
            return Ok(value);
        }
        if let Some(proxy) = self.cached(value.get_id()) {
            return Ok(proxy);
        }

        if is_class(vm, &value) {
            if attr_string(vm, &value, "__module__").as_deref() == Some(module_name) {
                self.wrap_class_methods(vm, &value, module_name)?;
            }
            return Ok(value);
        }

        // Foreign callables have no source to re-bind; the profiler covers
        // them.
        if is_builtin_function(vm, &value) {
            return Ok(value);
        }

        if !is_python_function(vm, &value) {
            return Ok(value);
        }
        if !owner_matches(vm, &value, module_name) {
            return Ok(value);
        }

        let func_name = attr_string(vm, &value, "__name__").unwrap_or_else(|| name.to_string());
        if func_name == "__repr__" || func_name == "__str__" {
            return Ok(value);
        }

        let original_id = value.get_id();
        let suspending = is_suspending(vm, &value);
        let proxy = self.make_event_proxy(vm, &value, module_name, &func_name, suspending)?;
        self.remember(original_id, proxy.clone());
        Ok(proxy)
    }

    /// Wrap a class method on first access (the lazy-descriptor rebind path).
    pub(crate) fn wrap_method(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        original: PyObjectRef,
        module_name: &str,
    ) -> PyResult<PyObjectRef> {
        if self.is_proxy(&original) || has_back_reference(vm, &original) {
            return Ok(original);
        }
        if let Some(proxy) = self.cached(original.get_id()) {
            return Ok(proxy);
        }
        let func_name =
            attr_string(vm, &original, "__name__").unwrap_or_else(|| "<method>".to_string());
        let original_id = original.get_id();
        let suspending = is_suspending(vm, &original);
        let proxy = self.make_event_proxy(vm, &original, module_name, &func_name, suspending)?;
        self.remember(original_id, proxy.clone());
        Ok(proxy)
    }

    // ── Class exports ─────────────────────────────────────────────────────────

    /// Replace each directly-defined method of `class` with a lazy descriptor.
    /// Resolution to the real proxy happens at first access per attribute, not
    /// eagerly, so class identity and descriptor semantics stay intact.
    fn wrap_class_methods(
        self: &Rc<Self>,
        vm: &VirtualMachine,
        class: &PyObjectRef,
        module_name: &str,
    ) -> PyResult<()> {
        let class_dict = class.get_attr("__dict__", vm)?;
        let keys = vm.call_method(&class_dict, "keys", ())?;
        let names: Vec<String> =
            vm.extract_elements_with(&keys, |obj| String::try_from_object(vm, obj))?;

        for name in names {
            if name.starts_with("__") {
                continue;
            }
            let Ok(member) =
                vm.call_method(&class_dict, "__getitem__", (vm.ctx.new_str(name.as_str()),))
            else {
                continue;
            };
            if !is_python_function(vm, &member) || self.is_proxy(&member) {
                continue;
            }

            let factory = Rc::clone(self);
            let module = module_name.to_string();
            let rebind = vm.new_function(
                "rebind",
                move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                    let original = args
                        .args
                        .first()
                        .cloned()
                        .ok_or_else(|| vm.new_type_error("rebind expects a callable".to_owned()))?;
                    factory.wrap_method(vm, original, &module)
                },
            );
            let lazy = self.lazy_method.call((rebind, member), vm)?;
            let name_py = vm.ctx.new_str(name.as_str());
            if let Err(err) = class.set_attr(&name_py, lazy, vm) {
                warn!(
                    "could not rebind method {module_name}.{name}: {}",
                    exception_text(vm, &err)
                );
            }
        }
        Ok(())
    }

    // ── Proxy construction ────────────────────────────────────────────────────

    /// Assemble a proxy from the support module's builders and a pair of
    /// native notification callbacks. Shared with the profiler, which injects
    /// its own callbacks.
    pub(crate) fn build_proxy(
        &self,
        vm: &VirtualMachine,
        original: &PyObjectRef,
        notify_call: PyObjectRef,
        notify_return: PyObjectRef,
        suspending: bool,
    ) -> PyResult<PyObjectRef> {
        let builder = if suspending {
            &self.suspending_proxy
        } else {
            &self.callable_proxy
        };
        builder.call((original.clone(), notify_call, notify_return), vm)
    }

    /// Proxy whose callbacks feed `on_call` / `on_return` with argument and
    /// return snapshots.
    fn make_event_proxy(
        &self,
        vm: &VirtualMachine,
        original: &PyObjectRef,
        module_name: &str,
        func_name: &str,
        suspending: bool,
    ) -> PyResult<PyObjectRef> {
        let notify_call = self.make_notify_call(vm, module_name, func_name);
        let notify_return = self.make_notify_return(vm, module_name, func_name);
        self.build_proxy(vm, original, notify_call, notify_return, suspending)
    }

    /// Native callback `(positional_count, keyword_names) -> None` invoked by
    /// a proxy before delegation. A policy denial surfaces here and aborts the
    /// call site.
    fn make_notify_call(
        &self,
        vm: &VirtualMachine,
        module_name: &str,
        func_name: &str,
    ) -> PyObjectRef {
        let engine = Arc::clone(&self.engine);
        let module = module_name.to_string();
        let func = func_name.to_string();
        vm.new_function(
            "notify_call",
            move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let positional = args
                    .args
                    .first()
                    .and_then(|o| i64::try_from_object(vm, o.clone()).ok())
                    .unwrap_or(0) as usize;
                let keywords = args
                    .args
                    .get(1)
                    .and_then(|o| vm.extract_elements_with(o, |obj| String::try_from_object(vm, obj)).ok())
                    .unwrap_or_default();
                let snapshot = CallArgs {
                    positional,
                    keywords,
                };
                if let Err(violation) = engine.on_call(&module, &func, &snapshot) {
                    return Err(policy_violation_to_py(vm, &violation));
                }
                Ok(vm.ctx.none())
            },
        )
        .into()
    }

    /// Native callback `(result) -> None` invoked by a proxy after the
    /// original completes. Not reached on exceptional exits, so no `return:`
    /// event is emitted for them.
    fn make_notify_return(
        &self,
        vm: &VirtualMachine,
        module_name: &str,
        func_name: &str,
    ) -> PyObjectRef {
        let engine = Arc::clone(&self.engine);
        let module = module_name.to_string();
        let func = func_name.to_string();
        vm.new_function(
            "notify_return",
            move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let snapshot = args
                    .args
                    .first()
                    .map(snapshot_return)
                    .unwrap_or(ReturnSnapshot::Unit);
                engine.on_return(&module, &func, &snapshot);
                Ok(vm.ctx.none())
            },
        )
        .into()
    }
}

// ── Inspection helpers ────────────────────────────────────────────────────────

/// `__dir__()` of a module, as plain strings.
pub(crate) fn module_export_names(
    vm: &VirtualMachine,
    module: &PyObjectRef,
) -> PyResult<Vec<String>> {
    let names = vm.call_method(module, "__dir__", ())?;
    vm.extract_elements_with(&names, |obj| String::try_from_object(vm, obj))
}

pub(crate) fn is_builtin_function(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value
        .class()
        .is(vm.ctx.types.builtin_function_or_method_type)
}

fn is_primitive(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    if vm.is_none(value) {
        return true;
    }
    let class = value.class();
    class.is(vm.ctx.types.str_type)
        || class.is(vm.ctx.types.int_type)
        || class.is(vm.ctx.types.float_type)
        || class.is(vm.ctx.types.bool_type)
        || class.is(vm.ctx.types.bytes_type)
}

fn is_module(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value.class().is(vm.ctx.types.module_type)
}

fn is_class(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value.class().is(vm.ctx.types.type_type)
}

fn is_python_function(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value.class().is(vm.ctx.types.function_type)
}

/// User-level wrappers advertise their original via `__wrapped__`; we neither
/// re-wrap those nor our own proxies.
fn has_back_reference(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    value.get_attr("__wrapped__", vm).is_ok()
}

fn attr_string(vm: &VirtualMachine, value: &PyObjectRef, attr: &'static str) -> Option<String> {
    let raw = value.get_attr(attr, vm).ok()?;
    if vm.is_none(&raw) {
        return None;
    }
    raw.str(vm).ok().map(|s| s.as_str().to_owned())
}

/// A callable belongs to `module_name` when its `__module__` equals it or is
/// nested below it.
fn owner_matches(vm: &VirtualMachine, value: &PyObjectRef, module_name: &str) -> bool {
    match attr_string(vm, value, "__module__") {
        Some(owner) => owner == module_name || owner.starts_with(&format!("{module_name}.")),
        None => false,
    }
}

/// Coroutine and async-generator functions must be wrapped with the
/// await-aware proxy; everything else gets the direct one.
fn is_suspending(vm: &VirtualMachine, value: &PyObjectRef) -> bool {
    let Ok(code) = value.get_attr("__code__", vm) else {
        return false;
    };
    let Ok(flags) = code.get_attr("co_flags", vm) else {
        return false;
    };
    match i64::try_from_object(vm, flags) {
        Ok(flags) => flags & (CO_COROUTINE | CO_ASYNC_GENERATOR) != 0,
        Err(_) => false,
    }
}

fn snapshot_return(result: &PyObjectRef) -> ReturnSnapshot {
    ReturnSnapshot::Value {
        type_name: result.class().name().to_string(),
    }
}

pub(crate) fn exception_text(
    vm: &VirtualMachine,
    exc: &rustpython_vm::builtins::PyBaseExceptionRef,
) -> String {
    exc.as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "<unprintable exception>".to_owned())
}
