//! Result file discovery and pairing
//!
//! Files are named `results_<label>_<batch>_<timestamp>.json`; a file from
//! one vantage point pairs with the file of the other that shares label and
//! batch index.

use anyhow::Context;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tracing::{debug, warn};

use crate::model::RecordedSet;

fn file_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^results_([a-zA-Z\d]+)_(\d+)_.*\.json$").ok())
        .as_ref()
}

/// Label and batch index shared by paired files.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub label: String,
    pub batch: usize,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.label, self.batch)
    }
}

/// Parse a result file name.
pub fn parse_file_name(name: &str) -> Option<BatchKey> {
    let captures = file_pattern()?.captures(name)?;
    Some(BatchKey {
        label: captures.get(1)?.as_str().to_string(),
        batch: captures.get(2)?.as_str().parse().ok()?,
    })
}

/// Files holding the same batch at both vantage points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePair {
    pub key: BatchKey,
    pub a: PathBuf,
    pub b: PathBuf,
}

impl FilePair {
    /// Name of the side-A file, used as the report key.
    pub fn name(&self) -> String {
        self.a
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.key.to_string())
    }
}

/// Result files in `directory` by batch key. When several files share a
/// key the lexicographically last one is kept.
pub fn index_directory(directory: &Path) -> anyhow::Result<BTreeMap<BatchKey, PathBuf>> {
    let pattern = format!("{}/results_*.json", glob::Pattern::escape(&directory.to_string_lossy()));
    let mut index = BTreeMap::new();

    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid result directory {:?}", directory))?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(%err, "Skipping unreadable entry");
                None
            }
        })
        .collect();
    paths.sort();

    for path in paths {
        let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
            continue;
        };
        match parse_file_name(&name) {
            Some(key) => {
                if let Some(previous) = index.insert(key.clone(), path) {
                    warn!(%key, previous = %previous.display(), "Several files for one batch, keeping the latest");
                }
            }
            None => debug!(file = %name, "Not a result file"),
        }
    }
    Ok(index)
}

/// Pair result files of two directories by label and batch index.
pub fn pair_directories(dir_a: &Path, dir_b: &Path) -> anyhow::Result<Vec<FilePair>> {
    let index_a = index_directory(dir_a)?;
    let mut index_b = index_directory(dir_b)?;

    let mut pairs = Vec::new();
    for (key, a) in index_a {
        match index_b.remove(&key) {
            Some(b) => pairs.push(FilePair { key, a, b }),
            None => warn!(%key, "No counterpart in the second directory"),
        }
    }
    for key in index_b.keys() {
        warn!(%key, "No counterpart in the first directory");
    }
    Ok(pairs)
}

/// Read a result file back as flattened fields.
pub async fn load_recorded(path: &Path) -> anyhow::Result<RecordedSet> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("Cannot read result file {:?}", path))?;
    let contents = String::from_utf8_lossy(&bytes);
    serde_json::from_str(&contents).with_context(|| format!("Malformed result file {:?}", path))
}
