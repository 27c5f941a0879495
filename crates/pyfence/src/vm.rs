//! RustPython VM lifecycle for the pyfence library.
//!
//! This module owns all RustPython API calls that are not hook-specific. It:
//! - Creates the interpreter with stdlib, the frozen `_pyfence_support` helper
//!   module, and the hosted script's directory on `sys.path`.
//! - Compiles and executes the hosted script, returning a structured
//!   [`RunError`] on failure.
//! - Maps enforcement failures across the Rust/Python boundary: a
//!   [`PolicyViolation`] is raised into the VM as an `ImportError` /
//!   `RuntimeError` carrying a sentinel prefix, and recovered from the escaping
//!   exception when the script aborts.
//!
//! ## Import interception
//!
//! RustPython 0.3 resolves every import by calling `builtins.__import__` (see
//! `src/vm/mod.rs` `import()` method), so rebinding that one primitive
//! observes cached and uncached loads alike. The rebinding happens inside
//! `interp.enter()` after full initialization, because `builtins.__import__`
//! is only set by `vm.initialize()` — the `with_init` closure runs too early.
//! The hook itself lives in `interceptor.rs`; this file provides the sentinel
//! plumbing it needs.
//!
//! ## Zero unsafe blocks
//!
//! This file contains no `unsafe` code. All RustPython integration uses the
//! safe public Rust API.

use std::path::Path;

use rustpython_vm::{
    builtins::PyBaseExceptionRef, compiler::Mode as CompileMode, AsObject, Interpreter,
    PyObjectRef, PyResult, VirtualMachine,
};

use crate::types::{PolicyViolation, RunError};

/// Name of the frozen helper module that hosts the Python-level proxies.
pub(crate) const SUPPORT_MODULE: &str = "_pyfence_support";

// Sentinel prefixes used to carry a policy decision through the VM's exception
// machinery. Module names cannot contain ':', so `split_once` recovers the
// original fields losslessly.
const IMPORT_DENIED_MARK: &str = "PyfenceImportDenied:";
const CALL_DENIED_MARK: &str = "PyfenceCallDenied:";

// ── Interpreter construction ──────────────────────────────────────────────────

/// Return candidate filesystem paths for a Python standard library installation.
///
/// RustPython can use pure-Python stdlib modules (json, collections, re, etc.)
/// from a host Python installation when they are added to `Settings::path_list`.
/// Native extension modules provided by `rustpython_stdlib::get_module_inits()`
/// take precedence over any .so files on the same path.
fn python_stdlib_paths() -> Vec<String> {
    let candidates = [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/local/lib/python3.10",
        "/usr/local/lib/python3.9",
        "/usr/lib/python3",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3.10",
    ];
    candidates
        .iter()
        .filter(|p| Path::new(p).is_dir())
        .map(|p| p.to_string())
        .collect()
}

/// Create a new RustPython interpreter prepared for hosting an instrumented
/// script.
///
/// `script_dir` (the hosted script's parent directory) is appended to
/// `sys.path` so the script's sibling modules resolve the way they would under
/// a plain interpreter run.
pub(crate) fn build_interpreter(script_dir: Option<&Path>) -> Interpreter {
    let mut settings = rustpython_vm::Settings::default();

    for path in python_stdlib_paths() {
        settings.path_list.push(path);
    }
    if let Some(dir) = script_dir {
        settings.path_list.push(dir.display().to_string());
    }

    Interpreter::with_init(settings, move |vm| {
        // Native (Rust-implemented) stdlib modules: math, _json, zlib, etc.
        // These are the "foreign binary" modules of this host; they have no
        // __file__ and are profiled rather than source-wrapped.
        vm.add_native_modules(rustpython_stdlib::get_module_inits());

        // Python-level helpers for the wrapper factory. Proxies that must obey
        // descriptor or coroutine protocols are generated here, in Python,
        // with the notify callbacks injected from Rust.
        vm.add_frozen(rustpython_vm::py_freeze!(
            source = r#"
def _adopt_metadata(proxy, original):
    try:
        proxy.__name__ = original.__name__
        proxy.__qualname__ = original.__qualname__
        proxy.__doc__ = original.__doc__
    except AttributeError:
        pass
    proxy.__wrapped__ = original


def callable_proxy(original, notify_call, notify_return):
    def proxy(*args, **kwargs):
        notify_call(len(args), list(kwargs))
        result = original(*args, **kwargs)
        notify_return(result)
        return result

    _adopt_metadata(proxy, original)
    return proxy


def suspending_proxy(original, notify_call, notify_return):
    async def proxy(*args, **kwargs):
        notify_call(len(args), list(kwargs))
        result = await original(*args, **kwargs)
        notify_return(result)
        return result

    _adopt_metadata(proxy, original)
    return proxy


class _LazyMethod:
    def __init__(self, rebind, original):
        self._rebind = rebind
        self._original = original
        self._proxy = None

    def __get__(self, instance, owner=None):
        if self._proxy is None:
            self._proxy = self._rebind(self._original)
        if instance is None:
            return self._proxy
        return self._proxy.__get__(instance, owner)


def lazy_method(rebind, original):
    return _LazyMethod(rebind, original)
"#,
            module_name = "_pyfence_support"
        ));
    })
}

/// Import the frozen support module.
///
/// Must run before the import primitive is rebound so the helper import is
/// neither recorded nor policed.
pub(crate) fn import_support_module(vm: &VirtualMachine) -> PyResult<PyObjectRef> {
    let import_fn = vm.builtins.get_attr("__import__", vm)?;
    import_fn.call((vm.ctx.new_str(SUPPORT_MODULE),), vm)
}

// ── Policy <-> exception mapping ──────────────────────────────────────────────

/// Raise a policy decision into the VM as the host exception that aborts the
/// offending operation: `ImportError` for denied imports, `RuntimeError` for
/// denied calls.
pub(crate) fn policy_violation_to_py(
    vm: &VirtualMachine,
    violation: &PolicyViolation,
) -> PyBaseExceptionRef {
    match violation {
        PolicyViolation::ImportDenied { parent, name } => vm.new_import_error(
            format!("{IMPORT_DENIED_MARK}{parent}:{name}"),
            vm.ctx.new_str(name.as_str()),
        ),
        PolicyViolation::CallDenied { module, func } => {
            vm.new_runtime_error(format!("{CALL_DENIED_MARK}{module}:{func}"))
        }
    }
}

/// Recover a [`PolicyViolation`] from an escaping exception, if it carries one
/// of the sentinel prefixes. Returns `None` for ordinary exceptions.
pub(crate) fn extract_policy_violation(
    vm: &VirtualMachine,
    exc: &PyBaseExceptionRef,
) -> Option<PolicyViolation> {
    let msg = exc.as_object().str(vm).ok()?;
    let msg = msg.as_str();
    if let Some(rest) = msg.strip_prefix(IMPORT_DENIED_MARK) {
        let (parent, name) = rest.split_once(':')?;
        return Some(PolicyViolation::ImportDenied {
            parent: parent.to_string(),
            name: name.to_string(),
        });
    }
    if let Some(rest) = msg.strip_prefix(CALL_DENIED_MARK) {
        let (module, func) = rest.split_once(':')?;
        return Some(PolicyViolation::CallDenied {
            module: module.to_string(),
            func: func.to_string(),
        });
    }
    None
}

// ── Script execution ──────────────────────────────────────────────────────────

/// Set `sys.argv` to the hosted script's view: the script path followed by its
/// passthrough arguments.
pub(crate) fn set_script_argv(
    vm: &VirtualMachine,
    script: &Path,
    args: &[String],
) -> PyResult<()> {
    let mut argv: Vec<PyObjectRef> = Vec::with_capacity(args.len() + 1);
    argv.push(vm.ctx.new_str(script.display().to_string()).into());
    for arg in args {
        argv.push(vm.ctx.new_str(arg.as_str()).into());
    }
    vm.sys_module
        .set_attr("argv", vm.ctx.new_list(argv), vm)?;
    Ok(())
}

/// Compile and execute the hosted script with `__name__ == "__main__"`.
///
/// Returns `None` on normal completion, or a structured [`RunError`]:
/// syntax errors, policy denials (recovered from the sentinel exceptions),
/// `sys.exit` codes, and plain runtime errors with a formatted traceback.
pub(crate) fn execute_script(
    vm: &VirtualMachine,
    source: &str,
    script_name: &str,
) -> Option<RunError> {
    let code = match vm.compile(source, CompileMode::Exec, script_name.to_owned()) {
        Ok(code) => code,
        Err(err) => return Some(extract_syntax_error(err)),
    };

    let scope = vm.new_scope_with_builtins();
    let _ = scope
        .globals
        .set_item("__name__", vm.ctx.new_str("__main__").into(), vm);
    let _ = scope
        .globals
        .set_item("__file__", vm.ctx.new_str(script_name).into(), vm);

    match vm.run_code_obj(code, scope) {
        Ok(_) => None,
        Err(exc) => {
            if let Some(violation) = extract_policy_violation(vm, &exc) {
                return Some(RunError::PolicyDenied { violation });
            }
            if let Some(code) = extract_exit_code(vm, &exc) {
                return Some(RunError::Exit { code });
            }
            Some(extract_runtime_error(vm, exc))
        }
    }
}

/// Convert a RustPython compile error into [`RunError::SyntaxError`].
fn extract_syntax_error(err: rustpython_vm::compiler::CompileError) -> RunError {
    let (row, col) = err.python_location();
    RunError::SyntaxError {
        message: err.to_string(),
        line: row as u32,
        col: col as u32,
    }
}

/// Recognize `SystemExit` and extract its status code.
///
/// `sys.exit()` carries `None` (status 0), an integer status, or an arbitrary
/// message object (status 1, matching the reference interpreter).
fn extract_exit_code(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Option<i32> {
    if exc.as_object().class().name().to_string() != "SystemExit" {
        return None;
    }
    let code = exc.as_object().get_attr("code", vm).ok()?;
    if vm.is_none(&code) {
        return Some(0);
    }
    use rustpython_vm::TryFromObject;
    match i32::try_from_object(vm, code) {
        Ok(status) => Some(status),
        Err(_) => Some(1),
    }
}

/// Convert a runtime exception into [`RunError::RuntimeError`].
///
/// Uses `vm.write_exception` to capture the full traceback. `String` implements
/// `rustpython_vm::py_io::Write` via `write_fmt`, so no custom wrapper needed.
fn extract_runtime_error(vm: &VirtualMachine, exc: PyBaseExceptionRef) -> RunError {
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "unknown runtime error".to_owned());

    let mut traceback = String::new();
    let _ = vm.write_exception(&mut traceback, &exc);

    RunError::RuntimeError { message, traceback }
}
