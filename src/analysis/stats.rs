//! Category statistics

use serde::Serialize;
use std::collections::BTreeMap;

/// Occurrences per censorship category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    counts: BTreeMap<String, usize>,
}

impl Statistics {
    pub fn tally<'a, I>(categories: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts = BTreeMap::new();
        for category in categories {
            *counts.entry(category.to_string()).or_insert(0) += 1;
        }
        Self { counts }
    }

    pub fn count(&self, category: &str) -> usize {
        self.counts.get(category).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Most frequent first, ties by name.
    pub fn ranked(&self) -> Vec<(&str, usize)> {
        let mut ranked: Vec<(&str, usize)> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
    }

    /// `- <category>: <n> occurrences` per category.
    pub fn lines(&self) -> Vec<String> {
        self.ranked()
            .into_iter()
            .map(|(category, count)| format!("- {}: {} occurrences", category, count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_counts_each_category() {
        let stats = Statistics::tally(["DNS manipulation", "No censorship found", "DNS manipulation"]);
        assert_eq!(stats.count("DNS manipulation"), 2);
        assert_eq!(stats.count("No censorship found"), 1);
        assert_eq!(stats.count("TCP manipulation"), 0);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_lines_rank_by_frequency() {
        let stats = Statistics::tally(["b", "a", "c", "c"]);
        assert_eq!(
            stats.lines(),
            vec!["- c: 2 occurrences", "- a: 1 occurrences", "- b: 1 occurrences"]
        );
    }

    #[test]
    fn test_tally_is_stateless() {
        let first = Statistics::tally(["x"]);
        let second = Statistics::tally(["x"]);
        assert_eq!(first, second);
        assert!(Statistics::tally(std::iter::empty()).is_empty());
    }
}
