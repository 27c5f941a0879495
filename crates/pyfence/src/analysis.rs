//! Analysis plug-in contract and the two analyses shipped with the CLI.
//!
//! An analysis is any value implementing [`Analysis`]; every method has a
//! default no-op body, so implementors override only the events they care
//! about. Callbacks return `Result<(), AnalysisError>`: the engine logs a
//! failure and continues as if the analysis had silently accepted the event.
//! Analyses must be thread-safe — the engine does not serialize them.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use crate::types::{AnalysisError, CallArgs, ReturnSnapshot};

pub trait Analysis: Send + Sync {
    /// Short name used in log lines when a callback fails.
    fn name(&self) -> &str;

    fn on_import(&self, _parent: Option<&str>, _name: &str) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_call(&self, _module: &str, _func: &str, _args: &CallArgs) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn on_return(
        &self,
        _module: &str,
        _func: &str,
        _result: &ReturnSnapshot,
    ) -> Result<(), AnalysisError> {
        Ok(())
    }
}

thread_local! {
    // Per-thread stack of call-entry timestamps. Calls and returns are
    // well-nested on a thread, so a plain stack pairs them; a missing return
    // (exceptional exit) leaves its entry to be discarded with the thread.
    static PERF_STACK: RefCell<Vec<Instant>> = const { RefCell::new(Vec::new()) };
}

/// Measures wall-clock duration of each observed call and appends one line per
/// completed call to its log file.
pub struct PerfAnalyzer {
    out: Mutex<File>,
}

impl PerfAnalyzer {
    pub fn create(path: &Path) -> Result<Self, AnalysisError> {
        Ok(PerfAnalyzer {
            out: Mutex::new(File::create(path)?),
        })
    }
}

impl Analysis for PerfAnalyzer {
    fn name(&self) -> &str {
        "perf"
    }

    fn on_call(&self, _module: &str, _func: &str, _args: &CallArgs) -> Result<(), AnalysisError> {
        PERF_STACK.with(|stack| stack.borrow_mut().push(Instant::now()));
        Ok(())
    }

    fn on_return(
        &self,
        module: &str,
        func: &str,
        _result: &ReturnSnapshot,
    ) -> Result<(), AnalysisError> {
        let start = PERF_STACK.with(|stack| stack.borrow_mut().pop());
        if let Some(start) = start {
            let elapsed = start.elapsed();
            let mut out = self.out.lock().expect("PerfAnalyzer mutex poisoned");
            writeln!(out, "{module}.{func} took {:.6}s", elapsed.as_secs_f64())?;
        }
        Ok(())
    }
}

/// Logs the Python type name of each observed return value.
pub struct TypeLogger {
    out: Mutex<File>,
}

impl TypeLogger {
    pub fn create(path: &Path) -> Result<Self, AnalysisError> {
        Ok(TypeLogger {
            out: Mutex::new(File::create(path)?),
        })
    }
}

impl Analysis for TypeLogger {
    fn name(&self) -> &str {
        "types"
    }

    fn on_return(
        &self,
        module: &str,
        func: &str,
        result: &ReturnSnapshot,
    ) -> Result<(), AnalysisError> {
        let mut out = self.out.lock().expect("TypeLogger mutex poisoned");
        writeln!(out, "{module}.{func} -> {}", result.describe())?;
        Ok(())
    }
}
