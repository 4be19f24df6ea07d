//! Cross-vantage comparator
//!
//! Compares the flattened results of the same targets probed from two
//! vantage points. Volatile fields are dropped first; headers are compared
//! one by one, skipping denylisted names, and values that look like JSON
//! are parsed on both sides before comparing.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::config::CompareConfig;
use crate::model::{fields, FieldMap, ProbeValue, RecordedSet};

/// Values of one differing field at each vantage point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    #[serde(rename = "A")]
    pub a: ProbeValue,
    #[serde(rename = "B")]
    pub b: ProbeValue,
}

/// Differing fields of one target. Header differences are kept apart and
/// serialized under `Headers`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffRecord {
    pub fields: BTreeMap<String, FieldDiff>,
    pub headers: BTreeMap<String, FieldDiff>,
}

impl DiffRecord {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.headers.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&FieldDiff> {
        self.fields.get(field)
    }

    /// Number of differing fields and headers.
    pub fn len(&self) -> usize {
        self.fields.len() + self.headers.len()
    }

    /// Write the record into an already open serializer map.
    pub(crate) fn serialize_entries<M: SerializeMap>(&self, map: &mut M) -> Result<(), M::Error> {
        for (name, diff) in &self.fields {
            map.serialize_entry(name, diff)?;
        }
        if !self.headers.is_empty() {
            map.serialize_entry(fields::HEADERS, &self.headers)?;
        }
        Ok(())
    }
}

impl Serialize for DiffRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        self.serialize_entries(&mut map)?;
        map.end()
    }
}

/// Differences between two result sets of the same batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetDiff {
    /// Targets present on both sides, with their differences (possibly empty)
    pub records: BTreeMap<String, DiffRecord>,
    /// Fields present for a target on one side only
    pub one_sided_fields: usize,
    /// Targets present in one set only
    pub one_sided_targets: usize,
}

impl SetDiff {
    pub fn differing(&self) -> usize {
        self.records.values().filter(|record| !record.is_empty()).count()
    }

    pub fn identical(&self) -> usize {
        self.records.values().filter(|record| record.is_empty()).count()
    }
}

/// Comparator settings.
#[derive(Debug, Clone)]
pub struct Differ {
    volatile_fields: BTreeSet<String>,
    /// Lowercased header names
    ignored_headers: BTreeSet<String>,
}

impl Default for Differ {
    fn default() -> Self {
        Self::from_config(&CompareConfig::default())
    }
}

impl Differ {
    pub fn new<I, J, S, T>(volatile_fields: I, ignored_headers: J) -> Self
    where
        I: IntoIterator<Item = S>,
        J: IntoIterator<Item = T>,
        S: Into<String>,
        T: AsRef<str>,
    {
        Self {
            volatile_fields: volatile_fields.into_iter().map(Into::into).collect(),
            ignored_headers: ignored_headers
                .into_iter()
                .map(|name| name.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &CompareConfig) -> Self {
        Self::new(config.volatile_fields.iter().cloned(), config.ignored_headers.iter())
    }

    /// Compare every target present in both sets.
    pub fn diff_sets(&self, a: &RecordedSet, b: &RecordedSet) -> SetDiff {
        let mut diff = SetDiff::default();

        for (target, fields_a) in a {
            match b.get(target) {
                Some(fields_b) => {
                    let (record, one_sided) = self.diff_target(fields_a, fields_b);
                    diff.one_sided_fields += one_sided;
                    diff.records.insert(target.clone(), record);
                }
                None => diff.one_sided_targets += 1,
            }
        }
        diff.one_sided_targets += b.keys().filter(|target| !a.contains_key(*target)).count();
        diff
    }

    /// Compare one target. Returns the differences and the number of
    /// non-volatile fields present on one side only.
    pub fn diff_target(&self, a: &FieldMap, b: &FieldMap) -> (DiffRecord, usize) {
        let mut record = DiffRecord::default();
        let mut one_sided = 0;

        for (name, value_a) in a {
            if self.volatile_fields.contains(name) {
                continue;
            }
            let Some(value_b) = b.get(name) else {
                one_sided += 1;
                continue;
            };

            if name == fields::HEADERS {
                if let (ProbeValue::Headers(headers_a), ProbeValue::Headers(headers_b)) = (value_a, value_b) {
                    record.headers = self.diff_headers(headers_a, headers_b);
                    continue;
                }
            }

            if value_a != value_b {
                record.fields.insert(
                    name.clone(),
                    FieldDiff { a: value_a.clone(), b: value_b.clone() },
                );
            }
        }

        one_sided += b
            .keys()
            .filter(|name| !self.volatile_fields.contains(*name) && !a.contains_key(*name))
            .count();
        (record, one_sided)
    }

    /// Compare headers present on both sides, skipping ignored names.
    fn diff_headers(
        &self,
        a: &BTreeMap<String, String>,
        b: &BTreeMap<String, String>,
    ) -> BTreeMap<String, FieldDiff> {
        let mut diffs = BTreeMap::new();

        for (name, value_a) in a {
            if self.ignored_headers.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            let Some(value_b) = b.get(name) else {
                continue;
            };

            let (Some(normal_a), Some(normal_b)) =
                (normalize_header(name, value_a), normalize_header(name, value_b))
            else {
                continue;
            };

            if normal_a != normal_b {
                diffs.insert(name.clone(), FieldDiff { a: normal_a, b: normal_b });
            }
        }
        diffs
    }
}

/// Header value as compared: JSON-looking values are parsed, others are
/// kept as text. `None` when a JSON-looking value does not parse.
fn normalize_header(name: &str, value: &str) -> Option<ProbeValue> {
    if !value.starts_with('{') {
        return Some(ProbeValue::text(value));
    }
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(parsed) => Some(ProbeValue::Record(parsed)),
        Err(err) => {
            warn!(header = name, %err, "Skipping unparseable structured header");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ESTABLISHED, NOT_AVAILABLE, OK};

    /// Flattened result for example.com as both vantage points see it.
    fn baseline() -> FieldMap {
        let mut map = FieldMap::new();
        map.insert(fields::TIME.into(), ProbeValue::Ratio(3.21));
        map.insert(fields::URL.into(), ProbeValue::text("example.com"));
        map.insert(fields::DNS_STATUS.into(), ProbeValue::text(OK));
        map.insert(fields::DNS_IPS.into(), ProbeValue::Addresses(vec!["93.184.216.34".into()]));
        map.insert(fields::TCP_STATUS.into(), ProbeValue::text(ESTABLISHED));
        map.insert(fields::PING_STATUS.into(), ProbeValue::text(OK));
        map.insert(fields::HTTP_STATUS.into(), ProbeValue::Integer(200));
        map.insert(fields::CONTENT_LENGTH.into(), ProbeValue::Integer(1256));
        map.insert(fields::HTML_CONTENT.into(), ProbeValue::text("<html></html>"));
        map.insert(fields::TIMESTAMP.into(), ProbeValue::text("2024-03-01 10:00:00"));

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "text/html".to_string());
        headers.insert("Date".to_string(), "Fri, 01 Mar 2024 10:00:00 GMT".to_string());
        map.insert(fields::HEADERS.into(), ProbeValue::Headers(headers));
        map
    }

    fn set(map: FieldMap) -> RecordedSet {
        let mut set = RecordedSet::new();
        set.insert("example.com".to_string(), map);
        set
    }

    fn headers_mut(map: &mut FieldMap) -> &mut BTreeMap<String, String> {
        match map.get_mut(fields::HEADERS) {
            Some(ProbeValue::Headers(headers)) => headers,
            _ => panic!("baseline has headers"),
        }
    }

    #[test]
    fn test_identical_results_have_no_differences() {
        let a = baseline();
        let mut b = baseline();
        b.insert(fields::TIME.into(), ProbeValue::Ratio(9.87));
        b.insert(fields::TIMESTAMP.into(), ProbeValue::text("2024-03-01 10:05:00"));

        let diff = Differ::default().diff_sets(&set(a), &set(b));
        assert!(diff.records["example.com"].is_empty());
        assert_eq!(diff.identical(), 1);
        assert_eq!(diff.differing(), 0);
    }

    #[test]
    fn test_dns_status_difference_is_recorded() {
        let a = baseline();
        let mut b = baseline();
        b.insert(fields::DNS_STATUS.into(), ProbeValue::text(NOT_AVAILABLE));

        let diff = Differ::default().diff_sets(&set(a), &set(b));
        let record = &diff.records["example.com"];
        assert_eq!(record.len(), 1);
        assert_eq!(
            record.get(fields::DNS_STATUS),
            Some(&FieldDiff { a: ProbeValue::text(OK), b: ProbeValue::text(NOT_AVAILABLE) })
        );

        let json = serde_json::to_value(record).unwrap();
        assert_eq!(json, serde_json::json!({"DNS Status": {"A": "OK", "B": "N/A"}}));
    }

    #[test]
    fn test_ignored_headers_are_skipped_case_insensitively() {
        let a = baseline();
        let mut b = baseline();
        headers_mut(&mut b).insert("Date".into(), "Sat, 02 Mar 2024 11:00:00 GMT".into());
        headers_mut(&mut b).insert("SERVER".into(), "other".into());

        let mut a = a;
        headers_mut(&mut a).insert("SERVER".into(), "nginx".into());

        let diff = Differ::default().diff_sets(&set(a), &set(b));
        assert!(diff.records["example.com"].is_empty());
    }

    #[test]
    fn test_header_differences_nest_under_headers() {
        let a = baseline();
        let mut b = baseline();
        headers_mut(&mut b).insert("Content-Type".into(), "text/plain".into());

        let (record, _) = Differ::default().diff_target(&a, &b);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Headers": {"Content-Type": {"A": "text/html", "B": "text/plain"}}})
        );
    }

    #[test]
    fn test_structured_header_values_compare_parsed() {
        let mut a = baseline();
        let mut b = baseline();
        headers_mut(&mut a).insert("Report-To".into(), r#"{"group":"x","max_age":10}"#.into());
        headers_mut(&mut b).insert("Report-To".into(), r#"{"max_age": 10, "group": "x"}"#.into());
        headers_mut(&mut a).insert("NEL".into(), "{broken".into());
        headers_mut(&mut b).insert("NEL".into(), "{also broken".into());

        let (record, _) = Differ::default().diff_target(&a, &b);
        assert!(record.is_empty());
    }

    #[test]
    fn test_one_sided_fields_are_counted_not_diffed() {
        let a = baseline();
        let mut b = baseline();
        b.remove(fields::PING_STATUS);
        b.insert(fields::ERROR.into(), ProbeValue::text("aborted"));
        b.remove(fields::HTML_CONTENT);

        let (record, one_sided) = Differ::default().diff_target(&a, &b);
        assert!(record.is_empty());
        assert_eq!(one_sided, 2);

        let (_, reversed) = Differ::default().diff_target(&b, &a);
        assert_eq!(reversed, 2);
    }

    #[test]
    fn test_targets_missing_on_one_side_are_tallied() {
        let a = set(baseline());
        let mut b = RecordedSet::new();
        b.insert("other.example".to_string(), baseline());

        let diff = Differ::default().diff_sets(&a, &b);
        assert!(diff.records.is_empty());
        assert_eq!(diff.one_sided_targets, 2);
    }

    #[test]
    fn test_non_map_headers_compare_as_values() {
        let a = baseline();
        let mut b = baseline();
        b.insert(fields::HEADERS.into(), ProbeValue::na());

        let (record, _) = Differ::default().diff_target(&a, &b);
        assert!(record.get(fields::HEADERS).is_some());
    }

    #[test]
    fn test_comparison_is_repeatable() {
        let a = set(baseline());
        let mut changed = baseline();
        changed.insert(fields::HTTP_STATUS.into(), ProbeValue::Integer(403));
        headers_mut(&mut changed).insert("Content-Type".into(), "text/plain".into());
        let b = set(changed);

        let differ = Differ::default();
        let first = serde_json::to_string(&differ.diff_sets(&a, &b).records).unwrap();
        let second = serde_json::to_string(&differ.diff_sets(&a, &b).records).unwrap();
        assert_eq!(first, second);
    }
}
