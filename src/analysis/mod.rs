//! Cross-vantage analysis
//!
//! Pairs result files from two vantage points, diffs each target, assigns
//! a censorship category and tallies the categories.

pub mod classify;
pub mod differ;
pub mod pairing;
pub mod report;
pub mod stats;

pub use classify::{Condition, Literal, Predicate, Rule, RuleSet};
pub use differ::{DiffRecord, Differ, FieldDiff, SetDiff};
pub use pairing::{pair_directories, parse_file_name, BatchKey, FilePair};
pub use report::{CensorshipReport, Comparator, ComparisonReport, Totals};
pub use stats::Statistics;
