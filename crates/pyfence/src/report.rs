//! Learn-mode report artifacts.
//!
//! Three JSON files are emitted at shutdown:
//! - `dependencies.json` — `{ "dependencies": { "<module>": ["<child>", ...] } }`
//! - `events.json` — `{ "<module>": { "<kind>:<name>": true, ... } }`
//! - `allowlist.json` — `{ "allowlist": { "<module>": ["<name>", ...] } }`
//!
//! All maps are sorted (the engine snapshots come out of `BTreeMap`s) so the
//! artifacts are byte-stable across runs with the same observations.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;

use serde::Serialize;

#[derive(Serialize)]
struct DependenciesArtifact<'a> {
    dependencies: &'a BTreeMap<String, Vec<String>>,
}

#[derive(Serialize)]
struct AllowlistArtifact<'a> {
    allowlist: &'a BTreeMap<String, Vec<String>>,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, value).map_err(io::Error::from)
}

pub(crate) fn write_dependencies(
    path: &Path,
    dependencies: &BTreeMap<String, Vec<String>>,
) -> io::Result<()> {
    write_json(path, &DependenciesArtifact { dependencies })
}

pub(crate) fn write_events(
    path: &Path,
    events: &BTreeMap<String, Vec<String>>,
) -> io::Result<()> {
    // Presence-of-key is the truth value.
    let out: BTreeMap<&String, BTreeMap<&String, bool>> = events
        .iter()
        .map(|(module, tags)| (module, tags.iter().map(|tag| (tag, true)).collect()))
        .collect();
    write_json(path, &out)
}

pub(crate) fn write_allowlist(
    path: &Path,
    allowlist: &BTreeMap<String, Vec<String>>,
) -> io::Result<()> {
    write_json(path, &AllowlistArtifact { allowlist })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn btree(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_dependencies_artifact_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dependencies.json");
        write_dependencies(&path, &btree(&[("__main__", &["leaf"])])).expect("write");

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed["dependencies"]["__main__"][0], "leaf");
    }

    #[test]
    fn test_events_artifact_uses_presence_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.json");
        write_events(&path, &btree(&[("leaf", &["call:f", "return:f"])])).expect("write");

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(parsed["leaf"]["call:f"], true);
        assert_eq!(parsed["leaf"]["return:f"], true);
    }

    #[test]
    fn test_allowlist_artifact_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("allowlist.json");
        write_allowlist(&path, &btree(&[("__main__", &["leaf"]), ("leaf", &["f"])]))
            .expect("write");

        let allow = crate::config::load_allowlist(&path).expect("reload");
        assert_eq!(allow["__main__"], vec!["leaf"]);
        assert_eq!(allow["leaf"], vec!["f"]);
    }
}
