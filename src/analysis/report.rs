//! Comparison report
//!
//! Ties pairing, diffing and classification together and renders the
//! report document plus the printed totals.

use anyhow::Context;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{info, warn};

use super::classify::RuleSet;
use super::differ::{DiffRecord, Differ};
use super::pairing::{load_recorded, pair_directories};
use super::stats::Statistics;
use crate::model::RecordedSet;

/// Key of the assigned category in the report document.
pub const CATEGORY_KEY: &str = "CENSORSHIP TYPE";

/// A target's differences with the category they were classified as.
#[derive(Debug, Clone, PartialEq)]
pub struct CensorshipReport {
    pub record: DiffRecord,
    pub category: String,
}

impl Serialize for CensorshipReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        self.record.serialize_entries(&mut map)?;
        map.serialize_entry(CATEGORY_KEY, &self.category)?;
        map.end()
    }
}

/// Run totals across all compared file pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub differing_targets: usize,
    pub identical_targets: usize,
    pub one_sided_targets: usize,
    pub one_sided_fields: usize,
}

impl Totals {
    fn add(&mut self, other: Totals) {
        self.differing_targets += other.differing_targets;
        self.identical_targets += other.identical_targets;
        self.one_sided_targets += other.one_sided_targets;
        self.one_sided_fields += other.one_sided_fields;
    }

    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("Targets with differences: {}", self.differing_targets),
            format!("Identical targets: {}", self.identical_targets),
            format!("Targets missing on one side: {}", self.one_sided_targets),
            format!("Fields missing on one side: {}", self.one_sided_fields),
        ]
    }
}

/// Per-file reports of differing targets, keyed by side-A file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ComparisonReport {
    pub files: BTreeMap<String, BTreeMap<String, CensorshipReport>>,
    #[serde(skip)]
    pub totals: Totals,
}

impl ComparisonReport {
    pub fn statistics(&self) -> Statistics {
        Statistics::tally(
            self.files
                .values()
                .flat_map(|targets| targets.values())
                .map(|report| report.category.as_str()),
        )
    }

    pub async fn write_json<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .await
            .with_context(|| format!("Cannot write report to {:?}", path))?;
        info!(path = %path.display(), "Report written");
        Ok(())
    }
}

/// Diffs and classifies result sets.
#[derive(Debug, Clone, Default)]
pub struct Comparator {
    differ: Differ,
    rules: RuleSet,
}

impl Comparator {
    pub fn new(differ: Differ, rules: RuleSet) -> Self {
        Self { differ, rules }
    }

    /// Classify every differing target of one pair of sets.
    pub fn compare_sets(
        &self,
        a: &RecordedSet,
        b: &RecordedSet,
    ) -> (BTreeMap<String, CensorshipReport>, Totals) {
        let diff = self.differ.diff_sets(a, b);
        let totals = Totals {
            differing_targets: diff.differing(),
            identical_targets: diff.identical(),
            one_sided_targets: diff.one_sided_targets,
            one_sided_fields: diff.one_sided_fields,
        };

        let reports = diff
            .records
            .into_iter()
            .filter(|(_, record)| !record.is_empty())
            .map(|(target, record)| {
                let category = self.rules.classify(&record).to_string();
                (target, CensorshipReport { record, category })
            })
            .collect();
        (reports, totals)
    }

    /// Compare every paired result file of two directories.
    pub async fn compare_directories(&self, dir_a: &Path, dir_b: &Path) -> anyhow::Result<ComparisonReport> {
        let pairs = pair_directories(dir_a, dir_b)?;
        if pairs.is_empty() {
            warn!(a = %dir_a.display(), b = %dir_b.display(), "No paired result files found");
        }

        let mut report = ComparisonReport::default();
        for pair in pairs {
            let a = load_recorded(&pair.a).await?;
            let b = load_recorded(&pair.b).await?;
            let (reports, totals) = self.compare_sets(&a, &b);

            info!(file = %pair.name(), differing = totals.differing_targets, "Compared batch {}", pair.key);
            report.totals.add(totals);
            report.files.insert(pair.name(), reports);
        }
        Ok(report)
    }
}
