//! Censorship classification
//!
//! Rules are plain data: a named list of conditions, each naming a diff
//! field and one predicate per vantage point. A rule matches when any one
//! of its conditions holds; the first matching rule in declaration order
//! names the category. Rules can be loaded from YAML:
//!
//! ```yaml
//! rules:
//!   - name: TCP manipulation
//!     conditions:
//!       - field: TCP Status
//!         side_a: { op: equals, value: Established }
//!         side_b: { op: one_of, value: [Failed, N/A] }
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use super::differ::DiffRecord;
use crate::constants::{
    ESTABLISHED, FAIL, FAILED, MANIPULATE, MANIPULATED, NOT_AVAILABLE, NOT_REDIRECTED,
    NO_CENSORSHIP, NO_MANIPULATION, OK, REDIRECTED,
};
use crate::model::{fields, ProbeValue};

/// A constant a field value is compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Number(f64),
    Text(String),
}

impl Literal {
    fn matches(&self, value: &ProbeValue) -> bool {
        match self {
            Literal::Number(n) => value.as_f64() == Some(*n),
            Literal::Text(text) => value.as_str() == Some(text.as_str()),
        }
    }
}

impl From<&str> for Literal {
    fn from(text: &str) -> Self {
        Literal::Text(text.to_string())
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Literal::Number(n)
    }
}

/// Test applied to one side of a differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Holds for any value
    Any,
    Equals(Literal),
    OneOf(Vec<Literal>),
}

impl Predicate {
    pub fn holds(&self, value: &ProbeValue) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Equals(literal) => literal.matches(value),
            Predicate::OneOf(literals) => literals.iter().any(|literal| literal.matches(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Diff field the condition reads
    pub field: String,
    pub side_a: Predicate,
    pub side_b: Predicate,
    /// Additionally require both sides numeric and further apart than this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_exceeds: Option<f64>,
}

impl Condition {
    pub fn new(field: &str, side_a: Predicate, side_b: Predicate) -> Self {
        Self { field: field.to_string(), side_a, side_b, delta_exceeds: None }
    }

    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta_exceeds = Some(delta);
        self
    }

    /// A field absent from the diff never satisfies a condition.
    pub fn holds(&self, record: &DiffRecord) -> bool {
        let Some(diff) = record.get(&self.field) else {
            return false;
        };
        if !(self.side_a.holds(&diff.a) && self.side_b.holds(&diff.b)) {
            return false;
        }
        match self.delta_exceeds {
            None => true,
            Some(delta) => match (diff.a.as_f64(), diff.b.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() > delta,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Category assigned when the rule matches
    pub name: String,
    pub conditions: Vec<Condition>,
}

impl Rule {
    pub fn matches(&self, record: &DiffRecord) -> bool {
        self.conditions.iter().any(|condition| condition.holds(record))
    }
}

/// Ordered rule list; earlier rules take priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

fn equals(literal: impl Into<Literal>) -> Predicate {
    Predicate::Equals(literal.into())
}

fn one_of(literals: &[&str]) -> Predicate {
    Predicate::OneOf(literals.iter().map(|&text| Literal::from(text)).collect())
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RuleSet {
    /// The built-in rules.
    pub fn builtin() -> Self {
        let manipulation = || Condition::new("", equals(NO_MANIPULATION), equals(MANIPULATE));
        let rule = |name: &str, conditions: Vec<Condition>| Rule { name: name.to_string(), conditions };

        Self {
            rules: vec![
                rule(
                    "DNS manipulation",
                    vec![
                        Condition::new(fields::DNS_STATUS, equals(OK), equals(NOT_AVAILABLE)),
                        Condition { field: fields::DNS_REPEATED_QUERY.to_string(), ..manipulation() },
                        Condition { field: fields::DNS_HIJACKING.to_string(), ..manipulation() },
                    ],
                ),
                rule(
                    "TCP manipulation",
                    vec![Condition::new(fields::TCP_STATUS, equals(ESTABLISHED), one_of(&[FAILED, NOT_AVAILABLE]))],
                ),
                rule(
                    "PING interruption",
                    vec![Condition::new(fields::PING_STATUS, equals(OK), one_of(&[FAIL, NOT_AVAILABLE]))],
                ),
                rule(
                    "Forced redirection",
                    vec![Condition::new(fields::REDIRECT_STATUS, equals(NOT_REDIRECTED), equals(REDIRECTED))],
                ),
                rule(
                    "HTTP request rejection",
                    vec![Condition::new(fields::HTTP_STATUS, equals(200.0), Predicate::Any)],
                ),
                rule(
                    "HTTP content substitution",
                    vec![Condition::new(fields::CONTENT_LENGTH, Predicate::Any, Predicate::Any).with_delta(100.0)],
                ),
                rule(
                    "Search result manipulation",
                    vec![Condition::new(fields::SEARCH_PRESENCE, equals("Match"), equals("No match"))],
                ),
                rule(
                    "Middle box presence",
                    vec![
                        Condition::new(fields::MIDDLEBOX_HEADER, equals(NO_MANIPULATION), equals(MANIPULATED)),
                        Condition::new(fields::MIDDLEBOX_REQUEST_LINE, equals(0.0), equals(1.0)),
                    ],
                ),
            ],
        }
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let rules: RuleSet = serde_yaml::from_str(contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse classification rules: {}", e))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Load rules from a YAML file.
    pub async fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Cannot read rules file {:?}", path))?;
        Self::from_yaml(&contents)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(anyhow::anyhow!("Rule {} has no name", index));
            }
            if rule.conditions.is_empty() {
                return Err(anyhow::anyhow!("Rule '{}' has no conditions", rule.name));
            }
            if let Some(condition) = rule.conditions.iter().find(|c| c.field.is_empty()) {
                return Err(anyhow::anyhow!("Rule '{}' has a condition without a field: {:?}", rule.name, condition));
            }
        }
        Ok(())
    }

    /// Category for one target's differences.
    pub fn classify(&self, record: &DiffRecord) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(record))
            .map(|rule| rule.name.as_str())
            .unwrap_or(NO_CENSORSHIP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::differ::FieldDiff;
    use proptest::prelude::*;

    fn record(entries: &[(&str, ProbeValue, ProbeValue)]) -> DiffRecord {
        let mut record = DiffRecord::default();
        for (field, a, b) in entries {
            record.fields.insert(field.to_string(), FieldDiff { a: a.clone(), b: b.clone() });
        }
        record
    }

    #[test]
    fn test_empty_diff_is_no_censorship() {
        assert_eq!(RuleSet::builtin().classify(&DiffRecord::default()), NO_CENSORSHIP);
    }

    #[test]
    fn test_dns_status_loss_is_dns_manipulation() {
        let diff = record(&[(fields::DNS_STATUS, ProbeValue::text(OK), ProbeValue::na())]);
        assert_eq!(RuleSet::builtin().classify(&diff), "DNS manipulation");
    }

    #[test]
    fn test_single_condition_suffices() {
        let diff = record(&[(
            fields::DNS_HIJACKING,
            ProbeValue::text(NO_MANIPULATION),
            ProbeValue::text(MANIPULATE),
        )]);
        assert_eq!(RuleSet::builtin().classify(&diff), "DNS manipulation");
    }

    #[test]
    fn test_status_change_from_200_is_rejection() {
        let diff = record(&[(fields::HTTP_STATUS, ProbeValue::Integer(200), ProbeValue::Integer(403))]);
        assert_eq!(RuleSet::builtin().classify(&diff), "HTTP request rejection");

        let reversed = record(&[(fields::HTTP_STATUS, ProbeValue::Integer(403), ProbeValue::Integer(200))]);
        assert_eq!(RuleSet::builtin().classify(&reversed), NO_CENSORSHIP);
    }

    #[test]
    fn test_content_length_needs_large_delta() {
        let small = record(&[(fields::CONTENT_LENGTH, ProbeValue::Integer(1256), ProbeValue::Integer(1300))]);
        assert_eq!(RuleSet::builtin().classify(&small), NO_CENSORSHIP);

        let large = record(&[(fields::CONTENT_LENGTH, ProbeValue::Integer(1256), ProbeValue::Integer(312))]);
        assert_eq!(RuleSet::builtin().classify(&large), "HTTP content substitution");

        let text = record(&[(fields::CONTENT_LENGTH, ProbeValue::Integer(1256), ProbeValue::na())]);
        assert_eq!(RuleSet::builtin().classify(&text), NO_CENSORSHIP);
    }

    #[test]
    fn test_invalid_request_line_scores() {
        let diff = record(&[(fields::MIDDLEBOX_REQUEST_LINE, ProbeValue::Ratio(0.0), ProbeValue::Ratio(1.0))]);
        assert_eq!(RuleSet::builtin().classify(&diff), "Middle box presence");
    }

    #[test]
    fn test_earlier_rule_wins() {
        let diff = record(&[
            (fields::HTTP_STATUS, ProbeValue::Integer(200), ProbeValue::Integer(403)),
            (fields::TCP_STATUS, ProbeValue::text(ESTABLISHED), ProbeValue::text(FAILED)),
        ]);
        assert_eq!(RuleSet::builtin().classify(&diff), "TCP manipulation");

        let mut reordered = RuleSet::builtin();
        reordered.rules.swap(1, 4);
        assert_eq!(reordered.classify(&diff), "HTTP request rejection");
    }

    #[test]
    fn test_rules_from_yaml() {
        let yaml = r#"
rules:
  - name: Status drift
    conditions:
      - field: HTTP Status
        side_a: { op: equals, value: 200 }
        side_b: { op: one_of, value: [403, 451] }
  - name: Anything else
    conditions:
      - field: Content Length
        side_a: { op: any }
        side_b: { op: any }
        delta_exceeds: 10
"#;
        let rules = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(rules.rules.len(), 2);

        let blocked = record(&[(fields::HTTP_STATUS, ProbeValue::Integer(200), ProbeValue::Integer(451))]);
        assert_eq!(rules.classify(&blocked), "Status drift");

        let resized = record(&[(fields::CONTENT_LENGTH, ProbeValue::Integer(100), ProbeValue::Integer(150))]);
        assert_eq!(rules.classify(&resized), "Anything else");
    }

    #[test]
    fn test_builtin_rules_survive_yaml() {
        let yaml = serde_yaml::to_string(&RuleSet::builtin()).unwrap();
        assert_eq!(RuleSet::from_yaml(&yaml).unwrap(), RuleSet::builtin());
    }

    #[test]
    fn test_rules_without_conditions_are_rejected() {
        assert!(RuleSet::from_yaml("rules:\n  - name: empty\n    conditions: []\n").is_err());
        assert!(RuleSet::from_yaml("rules: nope\n").is_err());
    }

    fn any_value() -> impl Strategy<Value = ProbeValue> {
        prop_oneof![
            any::<i64>().prop_map(ProbeValue::Integer),
            (-1e6f64..1e6).prop_map(ProbeValue::Ratio),
            "[A-Za-z/ ]{0,12}".prop_map(ProbeValue::Text),
            prop::collection::vec("[0-9.]{1,15}", 0..3).prop_map(ProbeValue::Addresses),
            Just(ProbeValue::Record(serde_json::json!({"k": [1, 2]}))),
        ]
    }

    proptest! {
        #[test]
        fn classify_always_yields_a_known_category(
            entries in prop::collection::vec(
                (prop::sample::select(vec![
                    fields::DNS_STATUS, fields::TCP_STATUS, fields::PING_STATUS,
                    fields::HTTP_STATUS, fields::CONTENT_LENGTH, fields::REDIRECT_STATUS,
                    fields::MIDDLEBOX_REQUEST_LINE, fields::DNS_HIJACKING, "Unknown",
                ]), any_value(), any_value()),
                0..6,
            )
        ) {
            let mut diff = DiffRecord::default();
            for (field, a, b) in entries {
                diff.fields.insert(field.to_string(), FieldDiff { a, b });
            }
            let rules = RuleSet::builtin();
            let category = rules.classify(&diff);
            prop_assert!(category == NO_CENSORSHIP || rules.rules.iter().any(|r| r.name == category));
        }
    }
}
