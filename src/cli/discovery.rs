//! Experiment directory discovery
//!
//! Layout:
//!
//! ```text
//! <root>/kv_aligned_1/seed_0/prefill/*.jsonl[.gz]
//! <root>/kv_aligned_1/seed_0/decode/*.jsonl[.gz]
//! ```
//!
//! Every directory level named `<dimension>_<value>` adds one entry to the
//! configuration key (the value is the part after the last underscore). A
//! directory holding a `prefill` or `decode` subdirectory is a cell: prefill
//! traces are run A, decode traces run B. Trace files within a phase
//! directory are taken in name order.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::completeness::ConfigKey;
use crate::engine::{CellStreams, ExperimentInput};
use crate::error::{BisectarError, Result};
use crate::loader::TraceSource;

/// Phase directory holding run A traces
pub const RUN_A_DIR: &str = "prefill";
/// Phase directory holding run B traces
pub const RUN_B_DIR: &str = "decode";

/// Split a `<dimension>_<value>` directory name
#[must_use]
pub fn parse_dimension_dir(name: &str) -> Option<(String, String)> {
    let (dim, value) = name.rsplit_once('_')?;
    if dim.is_empty() || value.is_empty() {
        return None;
    }
    Some((dim.to_string(), value.to_string()))
}

fn is_trace_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_lowercase();
    path.is_file() && (name.ends_with(".jsonl") || name.ends_with(".jsonl.gz"))
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| BisectarError::IoError {
        message: format!("Failed to read directory {}: {e}", dir.display()),
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| BisectarError::IoError {
            message: format!("Failed to read directory {}: {e}", dir.display()),
        })?;
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Trace files of one phase directory, in name order
pub fn trace_files(dir: &Path) -> Result<Vec<TraceSource>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(read_dir_sorted(dir)?
        .into_iter()
        .filter(|p| is_trace_file(p))
        .map(TraceSource::File)
        .collect())
}

fn walk(dir: &Path, key: &ConfigKey, input: &mut ExperimentInput) -> Result<()> {
    let run_a = dir.join(RUN_A_DIR);
    let run_b = dir.join(RUN_B_DIR);
    if run_a.is_dir() || run_b.is_dir() {
        let cell = CellStreams::new(trace_files(&run_a)?, trace_files(&run_b)?);
        debug!(
            dir = %dir.display(),
            files_a = cell.a.len(),
            files_b = cell.b.len(),
            "discovered cell"
        );
        input.insert(key.clone(), cell);
    }

    for child in read_dir_sorted(dir)? {
        if !child.is_dir() {
            continue;
        }
        let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name == RUN_A_DIR || name == RUN_B_DIR {
            continue;
        }
        let Some((dim, value)) = parse_dimension_dir(name) else {
            continue;
        };
        let mut child_key = key.clone();
        child_key.insert(dim, value);
        walk(&child, &child_key, input)?;
    }
    Ok(())
}

/// Enumerate every cell under a traces root
pub fn discover(root: &Path) -> Result<ExperimentInput> {
    if !root.is_dir() {
        return Err(BisectarError::IoError {
            message: format!("Traces directory not found: {}", root.display()),
        });
    }
    let mut input = ExperimentInput::new();
    walk(root, &ConfigKey::new(), &mut input)?;
    Ok(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, "{\"layer\":0}\n").expect("write");
    }

    #[test]
    fn test_parse_dimension_dir() {
        assert_eq!(
            parse_dimension_dir("kv_aligned_1"),
            Some(("kv_aligned".to_string(), "1".to_string()))
        );
        assert_eq!(
            parse_dimension_dir("seed_0"),
            Some(("seed".to_string(), "0".to_string()))
        );
        assert_eq!(parse_dimension_dir("prefill"), None);
        assert_eq!(parse_dimension_dir("_1"), None);
        assert_eq!(parse_dimension_dir("seed_"), None);
    }

    #[test]
    fn test_discover_matrix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        for kv in ["0", "1"] {
            for seed in ["0", "1"] {
                let cell = root.join(format!("kv_aligned_{kv}")).join(format!("seed_{seed}"));
                touch(&cell.join("prefill/trace.jsonl"));
                if !(kv == "1" && seed == "1") {
                    touch(&cell.join("decode/trace.jsonl.gz"));
                }
            }
        }
        touch(&root.join("kv_aligned_0/seed_0/prefill/notes.txt"));

        let input = discover(root).expect("discover");
        assert_eq!(input.len(), 4);
        let key: ConfigKey = [("kv_aligned", "0"), ("seed", "0")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let cell = &input[&key];
        assert_eq!(cell.a.len(), 1);
        assert_eq!(cell.b.len(), 1);

        let missing: ConfigKey = [("kv_aligned", "1"), ("seed", "1")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert!(input[&missing].b.is_empty());
    }

    #[test]
    fn test_discover_missing_root() {
        assert!(discover(Path::new("/nonexistent/traces")).is_err());
    }

    #[test]
    fn test_trace_files_sorted() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(&dir.path().join("b.jsonl"));
        touch(&dir.path().join("a.jsonl"));
        let files = trace_files(dir.path()).expect("files");
        let names: Vec<_> = files.iter().map(TraceSource::name).collect();
        assert!(names[0].ends_with("a.jsonl"));
        assert!(names[1].ends_with("b.jsonl"));
    }
}
