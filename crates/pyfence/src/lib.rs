// pyfence: in-process instrumentation and policy-enforcement agent for an
// embedded RustPython runtime. Observes module imports, function calls, and
// returns; learn mode records the dependency graph and call surface and
// derives an allowlist, enforce mode rejects anything not in a previously
// learned allowlist.

pub mod analysis;
pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod report;
pub mod types;
pub(crate) mod interceptor;
pub(crate) mod profiler;
pub(crate) mod vm;
pub(crate) mod wrap;

pub use analysis::{Analysis, PerfAnalyzer, TypeLogger};
pub use bootstrap::{run_script, AgentOptions, HookSession};
pub use config::{load_allowlist, AgentConfig, TargetPattern, TargetSet};
pub use engine::HookEngine;
pub use types::{
    AgentError, AnalysisError, CallArgs, Mode, NativeCallable, PolicyViolation, ProfileEvent,
    ReturnSnapshot, RunError, RunSummary, ROOT_MODULE,
};
