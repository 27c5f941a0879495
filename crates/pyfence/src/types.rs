//! Foundational public types for the pyfence library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`Mode`] — learn (record) vs. enforce (allow/deny) operation
//! - [`PolicyViolation`] — the two enforcement failures that must escape
//! - [`CallArgs`] / [`ReturnSnapshot`] — host-agnostic event payloads
//! - [`RunError`] / [`RunSummary`] — the outcome of running a hosted script
//! - [`AgentError`] — failures of the agent itself (I/O, malformed artifacts)

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Synthetic module id for the root script.
pub const ROOT_MODULE: &str = "__main__";

/// Operating mode of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Record the dependency graph and call surface; derive the allowlist at
    /// shutdown.
    Learn,
    /// Consult a pre-existing allowlist and abort any import/call not in it.
    Enforce,
}

impl Mode {
    pub fn is_learn(self) -> bool {
        matches!(self, Mode::Learn)
    }

    pub fn is_enforce(self) -> bool {
        matches!(self, Mode::Enforce)
    }
}

/// A policy failure raised by the engine in enforce mode.
///
/// Unlike analysis faults these must escape: an `ImportDenied` aborts the
/// offending import statement in the hosted program, a `CallDenied` aborts the
/// call site.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PolicyViolation {
    /// The edge `parent -> name` is not in the allowlist.
    #[error("import of {name} not allowed in module {parent}")]
    ImportDenied { parent: String, name: String },

    /// `module.func` is not in the allowlist for `module`.
    #[error("blocked unauthorized call: {module}.{func}()")]
    CallDenied { module: String, func: String },
}

/// An error raised inside an analysis callback.
///
/// These are caught at the engine's fan-out barrier, logged, and swallowed;
/// they never alter the event stream or the hosted program's behavior.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AnalysisError(pub String);

impl From<std::io::Error> for AnalysisError {
    fn from(err: std::io::Error) -> Self {
        AnalysisError(err.to_string())
    }
}

/// Failures of the agent itself, outside the hosted program.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write reports to {path}: {source}")]
    Report {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Snapshot of a call's arguments as seen by analyses.
///
/// The engine never hands VM object references across the event boundary;
/// callers get the positional arity and the keyword names. Foreign calls carry
/// the empty snapshot — only name-level visibility is guaranteed for them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    pub positional: usize,
    pub keywords: Vec<String>,
}

/// Snapshot of a return value as seen by analyses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnSnapshot {
    /// Sentinel for foreign calls: the host profiler does not surface the
    /// return value.
    Unit,
    /// A source-level return, described by the Python type name of the result.
    Value { type_name: String },
}

impl ReturnSnapshot {
    pub fn value(type_name: impl Into<String>) -> Self {
        ReturnSnapshot::Value {
            type_name: type_name.into(),
        }
    }

    /// Human-readable type description, used by the type-logger analysis.
    pub fn describe(&self) -> &str {
        match self {
            ReturnSnapshot::Unit => "None",
            ReturnSnapshot::Value { type_name } => type_name,
        }
    }
}

/// Kind of a native-profiler event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileEvent {
    /// Entry into a foreign-binary function.
    Entry,
    /// Exit from a foreign-binary function.
    Exit,
}

/// Descriptor of a foreign callable, as surfaced by the native-call profiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCallable {
    /// Owning foreign module.
    pub module: String,
    /// Callable name within that module.
    pub name: String,
}

/// Structured error variants produced when a hosted script run fails.
///
/// Serialized with an internally-tagged `"type"` discriminator field so that
/// JSON consumers can switch on `error.type` without a wrapper object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunError {
    /// The script source could not be parsed.
    SyntaxError {
        message: String,
        /// 1-based line number of the error, or 0 if unknown.
        line: u32,
        /// 1-based column number of the error, or 0 if unknown.
        col: u32,
    },

    /// A Python exception escaped the script.
    RuntimeError { message: String, traceback: String },

    /// The script was aborted by an enforcement decision.
    PolicyDenied { violation: PolicyViolation },

    /// The script called `sys.exit(code)`.
    Exit { code: i32 },
}

/// The outcome of executing a hosted script under the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// `None` on normal completion; `Some(e)` if the run was terminated early.
    pub error: Option<RunError>,

    /// Elapsed wall-clock time of the run in nanoseconds.
    pub duration_ns: u64,
}
