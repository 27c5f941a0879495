//! One-shot installation and the top-level run orchestration.
//!
//! [`run_script`] is the library entry point the CLI uses:
//! 1. Load the target patterns from the config artifact (missing file: empty
//!    set — nothing is ever rewrapped, but imports are still observed).
//! 2. In enforce mode, load the allowlist (missing file: empty — every policed
//!    import and call is denied).
//! 3. Construct the [`HookEngine`].
//! 4. Inside the interpreter: rebind the import primitive, rewrap
//!    already-loaded target modules, and mark/shim the loaded foreign modules.
//! 5. Execute the hosted script.
//! 6. Flush the learn-mode artifacts. Report emission is an explicit step of
//!    the bootstrap, taken on normal completion and on script errors alike,
//!    but not when installation itself failed.
//!
//! Embedders that drive their own interpreter can call [`HookSession::install`]
//! directly and flush through the engine when their host shuts down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use rustpython_vm::{PyResult, VirtualMachine};

use crate::analysis::Analysis;
use crate::config::{load_allowlist, AgentConfig, TargetSet};
use crate::engine::HookEngine;
use crate::interceptor;
use crate::types::{AgentError, Mode, RunError, RunSummary};
use crate::vm;
use crate::wrap::WrapperFactory;

/// Installation inputs for one agent run.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub mode: Mode,
    /// Path to the config artifact defining hook targets.
    pub config_path: PathBuf,
    /// Path to the allowlist artifact (read in enforce mode only).
    pub allowlist_path: PathBuf,
    /// Directory receiving the learn-mode artifacts and analysis logs.
    pub outdir: PathBuf,
    /// When false, in-memory event recording is disabled; the dependency graph
    /// is still collected.
    pub log_events: bool,
}

impl AgentOptions {
    pub fn new(mode: Mode) -> Self {
        AgentOptions {
            mode,
            config_path: PathBuf::from("config.json"),
            allowlist_path: PathBuf::from("allowlist.json"),
            outdir: PathBuf::from("."),
            log_events: true,
        }
    }
}

/// A live installation: the hooks are in place in some interpreter and feed
/// the carried engine.
pub struct HookSession {
    engine: Arc<HookEngine>,
}

impl HookSession {
    /// Wire the interceptor, wrapper factory, and native shims into `vm`,
    /// feeding `engine`. The engine and target set are built by the caller;
    /// [`run_script`] shows the standard composition.
    pub fn install(
        vm: &VirtualMachine,
        engine: Arc<HookEngine>,
        targets: &TargetSet,
    ) -> PyResult<Self> {
        let factory = WrapperFactory::new(vm, Arc::clone(&engine))?;
        interceptor::install_import_hook(vm, &factory, &engine, targets)?;
        interceptor::rewrap_existing_targets(vm, &factory, targets)?;
        interceptor::mark_loaded_foreign_modules(vm, &factory, &engine)?;
        debug!("agent installed (targets empty: {})", targets.is_empty());
        Ok(HookSession { engine })
    }

    pub fn engine(&self) -> &Arc<HookEngine> {
        &self.engine
    }
}

/// Load the two input artifacts per the options.
fn load_inputs(
    options: &AgentOptions,
) -> Result<(TargetSet, std::collections::HashMap<String, Vec<String>>), AgentError> {
    let config = AgentConfig::load(&options.config_path)?;
    let allowlist = if options.mode.is_enforce() {
        load_allowlist(&options.allowlist_path)?
    } else {
        Default::default()
    };
    Ok((config.target_set(), allowlist))
}

/// Execute `script` under the agent and return the structured outcome.
///
/// The hosted script runs with `__name__ == "__main__"` and `sys.argv` set to
/// the script path plus `script_args`. In learn mode the three artifacts are
/// written into `options.outdir` after the run.
pub fn run_script(
    script: &Path,
    script_args: &[String],
    options: &AgentOptions,
    analyses: Vec<Box<dyn Analysis>>,
) -> Result<RunSummary, AgentError> {
    let start = Instant::now();

    let source = std::fs::read_to_string(script).map_err(|err| AgentError::Io {
        path: script.to_path_buf(),
        source: err,
    })?;
    let (targets, allowlist) = load_inputs(options)?;
    let engine = Arc::new(HookEngine::new(
        options.mode,
        analyses,
        allowlist,
        options.log_events,
    ));

    let interp = vm::build_interpreter(script.parent());
    let script_name = script.display().to_string();
    let engine_for_vm = Arc::clone(&engine);
    let (installed, error) = interp.enter(move |vm| {
        let _session = match HookSession::install(vm, engine_for_vm, &targets) {
            Ok(session) => session,
            Err(exc) => {
                let text = crate::wrap::exception_text(vm, &exc);
                return (
                    false,
                    Some(RunError::RuntimeError {
                        message: format!("agent installation failed: {text}"),
                        traceback: String::new(),
                    }),
                );
            }
        };
        let _ = vm::set_script_argv(vm, script, script_args);
        (true, vm::execute_script(vm, &source, &script_name))
    });

    if installed {
        engine
            .write_reports(&options.outdir)
            .map_err(|err| AgentError::Report {
                path: options.outdir.clone(),
                source: err,
            })?;
    }

    Ok(RunSummary {
        error,
        duration_ns: start.elapsed().as_nanos() as u64,
    })
}
