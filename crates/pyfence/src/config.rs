//! Configuration and allowlist artifacts.
//!
//! Two inputs govern a run:
//! - `config.json` — `{ "targets": ["leaf", "pkg.*"] }`, the module patterns
//!   whose exports get instrumented. A missing file yields an empty target
//!   set: hooks are still installed (imports are still observed and policed)
//!   but no module is ever rewrapped.
//! - `allowlist.json` — `{ "allowlist": { "<module>": ["<name>", ...] } }`,
//!   consumed in enforce mode. A missing file yields an empty allowlist, so
//!   every policed import and call is denied.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::AgentError;

/// A module-name matcher: either an exact dotted name or a prefix pattern.
///
/// `"pkg.*"` matches any module whose fully qualified name begins with
/// `"pkg."`; a bare trailing `*` (`"pkg*"`) matches on the raw prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPattern {
    Exact(String),
    Prefix(String),
}

impl TargetPattern {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => TargetPattern::Prefix(prefix.to_string()),
            None => TargetPattern::Exact(raw.to_string()),
        }
    }

    pub fn matches(&self, fullname: &str) -> bool {
        match self {
            TargetPattern::Exact(name) => fullname == name,
            TargetPattern::Prefix(prefix) => fullname.starts_with(prefix.as_str()),
        }
    }
}

/// The set of configured target patterns.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    patterns: Vec<TargetPattern>,
}

impl TargetSet {
    pub fn new(raw: &[String]) -> Self {
        TargetSet {
            patterns: raw.iter().map(|p| TargetPattern::parse(p)).collect(),
        }
    }

    pub fn matches(&self, fullname: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(fullname))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Shape of the `config.json` artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub targets: Vec<String>,
}

impl AgentConfig {
    /// Load the config artifact. A missing file is not an error and yields the
    /// empty config; malformed JSON is reported.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(AgentConfig::default());
            }
            Err(err) => {
                return Err(AgentError::Io {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };
        serde_json::from_str(&raw).map_err(|err| AgentError::Malformed {
            path: path.to_path_buf(),
            source: err,
        })
    }

    pub fn target_set(&self) -> TargetSet {
        TargetSet::new(&self.targets)
    }
}

/// Shape of the `allowlist.json` artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AllowlistArtifactIn {
    #[serde(default)]
    allowlist: HashMap<String, Vec<String>>,
}

/// Load the allowlist artifact for enforce mode. Missing file yields the empty
/// allowlist (deny everything that is policed).
pub fn load_allowlist(path: &Path) -> Result<HashMap<String, Vec<String>>, AgentError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HashMap::new());
        }
        Err(err) => {
            return Err(AgentError::Io {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };
    let artifact: AllowlistArtifactIn =
        serde_json::from_str(&raw).map_err(|err| AgentError::Malformed {
            path: path.to_path_buf(),
            source: err,
        })?;
    Ok(artifact.allowlist)
}
