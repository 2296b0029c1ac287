//! Compliance query model
//!
//! A [`ComplianceQuery`] names the nodes it needs (by alias), the explicit
//! edges that must connect them, timing windows between them, and weighted
//! proof criteria. Queries are plain data and load from TOML.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::errors::{EvidenceError, EvidenceResult};
use crate::model::{EdgeType, NodeKind, NodeRef};

/// Inclusive evaluation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> EvidenceResult<Self> {
        if from > to {
            return Err(EvidenceError::validation(
                "time_range",
                "range start is after its end",
            ));
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at <= self.to
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionOp {
    Eq,
    Ne,
    In,
    Prefix,
    Contains,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Test on one field of a node's JSON form, addressed by dotted path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn matches(&self, fields: &Value) -> bool {
        let actual = lookup(fields, &self.field).filter(|v| !v.is_null());
        match self.op {
            ConditionOp::Exists => {
                let want = self.value.as_bool().unwrap_or(true);
                actual.is_some() == want
            }
            ConditionOp::Eq => actual.is_some_and(|a| values_equal(a, &self.value)),
            ConditionOp::Ne => actual.is_some_and(|a| !values_equal(a, &self.value)),
            ConditionOp::In => actual.is_some_and(|a| {
                self.value
                    .as_array()
                    .is_some_and(|options| options.iter().any(|o| values_equal(a, o)))
            }),
            ConditionOp::Prefix => match (actual.and_then(Value::as_str), self.value.as_str()) {
                (Some(a), Some(prefix)) => a.starts_with(prefix),
                _ => false,
            },
            ConditionOp::Contains => match actual {
                Some(Value::String(a)) => self.value.as_str().is_some_and(|needle| a.contains(needle)),
                Some(Value::Array(items)) => items.iter().any(|i| values_equal(i, &self.value)),
                _ => false,
            },
            ConditionOp::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            ConditionOp::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            ConditionOp::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            ConditionOp::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// Walk a dotted path through nested objects.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    let actual = actual?;
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a.partial_cmp(&b);
    }
    let (a, b) = (actual.as_str()?, expected.as_str()?);
    match (
        DateTime::parse_from_rfc3339(a),
        DateTime::parse_from_rfc3339(b),
    ) {
        (Ok(x), Ok(y)) => Some(x.cmp(&y)),
        _ => Some(a.cmp(b)),
    }
}

/// Candidate nodes for one alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFilter {
    pub alias: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Restrict candidates to nodes whose timeline instant is in range.
    #[serde(default)]
    pub within_time_range: bool,
}

/// An explicit edge that must connect two aliased nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRequirement {
    pub edge_type: EdgeType,
    pub from: String,
    pub to: String,
    /// Optional edges left-join: bindings survive without them.
    #[serde(default)]
    pub optional: bool,
}

/// Window between two aliased nodes' instants, in hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeConstraint {
    pub from: String,
    #[serde(default)]
    pub from_field: Option<String>,
    pub to: String,
    #[serde(default)]
    pub to_field: Option<String>,
    #[serde(default)]
    pub min_hours: Option<f64>,
    #[serde(default)]
    pub max_hours: Option<f64>,
}

impl TimeConstraint {
    pub fn within(&self, hours: f64) -> bool {
        self.min_hours.is_none_or(|min| hours >= min) && self.max_hours.is_none_or(|max| hours <= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriterionType {
    Exists,
    Count,
    Value,
    Timing,
    Relationship,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CriterionCheck {
    Exists {
        alias: String,
    },
    Count {
        alias: String,
        min: usize,
    },
    Value {
        alias: String,
        condition: Condition,
    },
    Timing {
        constraint: TimeConstraint,
    },
    Relationship {
        edge_type: EdgeType,
        from: String,
        to: String,
    },
    Custom {
        name: String,
        #[serde(default)]
        params: Value,
    },
}

impl CriterionCheck {
    pub fn criterion_type(&self) -> CriterionType {
        match self {
            CriterionCheck::Exists { .. } => CriterionType::Exists,
            CriterionCheck::Count { .. } => CriterionType::Count,
            CriterionCheck::Value { .. } => CriterionType::Value,
            CriterionCheck::Timing { .. } => CriterionType::Timing,
            CriterionCheck::Relationship { .. } => CriterionType::Relationship,
            CriterionCheck::Custom { .. } => CriterionType::Custom,
        }
    }

    fn aliases(&self) -> Vec<&str> {
        match self {
            CriterionCheck::Exists { alias }
            | CriterionCheck::Count { alias, .. }
            | CriterionCheck::Value { alias, .. } => vec![alias],
            CriterionCheck::Timing { constraint } => vec![&constraint.from, &constraint.to],
            CriterionCheck::Relationship { from, to, .. } => vec![from, to],
            CriterionCheck::Custom { .. } => vec![],
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofCriterion {
    pub id: String,
    pub description: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub mandatory: bool,
    /// Shown in the gap list when the criterion is unmet.
    #[serde(default)]
    pub recommendation: Option<String>,
    pub check: CriterionCheck,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceQuery {
    pub query_id: String,
    pub regulation: String,
    pub article: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub required_confidence: f64,
    pub nodes: Vec<NodeFilter>,
    #[serde(default)]
    pub edges: Vec<EdgeRequirement>,
    #[serde(default)]
    pub time_constraints: Vec<TimeConstraint>,
    pub criteria: Vec<ProofCriterion>,
}

impl ComplianceQuery {
    pub fn filter(&self, alias: &str) -> Option<&NodeFilter> {
        self.nodes.iter().find(|n| n.alias == alias)
    }

    /// Structural checks: known aliases, edge kinds, sane weights.
    pub fn validate(&self) -> EvidenceResult<()> {
        let invalid = |message: String| EvidenceError::validation(format!("query {}", self.query_id), message);

        if self.nodes.is_empty() {
            return Err(invalid("at least one node filter is required".into()));
        }
        if self.criteria.is_empty() {
            return Err(invalid("at least one criterion is required".into()));
        }
        if !(0.0..=1.0).contains(&self.required_confidence) {
            return Err(invalid("required_confidence must be within 0..=1".into()));
        }

        let mut aliases = HashSet::new();
        for node in &self.nodes {
            if !aliases.insert(node.alias.as_str()) {
                return Err(invalid(format!("alias {} declared twice", node.alias)));
            }
        }

        let kind_of = |alias: &str| -> EvidenceResult<NodeKind> {
            self.filter(alias)
                .map(|f| f.kind)
                .ok_or_else(|| invalid(format!("unknown alias {alias}")))
        };
        for edge in &self.edges {
            let (from, to) = (kind_of(&edge.from)?, kind_of(&edge.to)?);
            if !edge.edge_type.allows(from, to) {
                return Err(invalid(format!(
                    "{} cannot connect {from} to {to}",
                    edge.edge_type
                )));
            }
        }
        for constraint in &self.time_constraints {
            kind_of(&constraint.from)?;
            kind_of(&constraint.to)?;
        }

        let mut ids = HashSet::new();
        for criterion in &self.criteria {
            if !ids.insert(criterion.id.as_str()) {
                return Err(invalid(format!("criterion {} declared twice", criterion.id)));
            }
            if !(criterion.weight.is_finite() && criterion.weight >= 0.0) {
                return Err(invalid(format!(
                    "criterion {} has a negative weight",
                    criterion.id
                )));
            }
            for alias in criterion.check.aliases() {
                kind_of(alias)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Proven,
    Partial,
    NotProven,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion_id: String,
    pub description: String,
    pub criterion_type: CriterionType,
    pub weight: f64,
    pub mandatory: bool,
    pub met: bool,
    pub evidence: Vec<NodeRef>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub alias: String,
    pub node: NodeRef,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub criterion_id: String,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceQueryResult {
    pub query_id: String,
    pub regulation: String,
    pub article: String,
    pub time_range: TimeRange,
    pub verdict: Verdict,
    pub confidence_score: f64,
    pub required_confidence: f64,
    pub criteria: Vec<CriterionResult>,
    pub evidence: Vec<EvidenceItem>,
    pub gaps: Vec<Gap>,
    /// Degraded ledger streams that contributed evidence.
    pub warnings: Vec<String>,
    pub evidence_digest: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_condition_ops() {
        let fields = json!({
            "status": "MET",
            "event_type": "BREACH.DETECTED",
            "regulatory_tags": ["GDPR", "NIS2"],
            "payload": {"records": 120},
            "deadline": "2026-03-04T00:00:00Z",
            "causation_id": null,
        });

        let cases = [
            (Condition::new("status", ConditionOp::Eq, json!("MET")), true),
            (Condition::new("status", ConditionOp::Ne, json!("MET")), false),
            (Condition::new("status", ConditionOp::In, json!(["RUNNING", "MET"])), true),
            (Condition::new("event_type", ConditionOp::Prefix, json!("BREACH.")), true),
            (Condition::new("regulatory_tags", ConditionOp::Contains, json!("NIS2")), true),
            (Condition::new("payload.records", ConditionOp::Gte, json!(120)), true),
            (Condition::new("payload.records", ConditionOp::Gt, json!(120.0)), false),
            (Condition::new("deadline", ConditionOp::Lt, json!("2026-03-04T01:00:00+01:00")), false),
            (Condition::new("deadline", ConditionOp::Lte, json!("2026-03-04T01:00:00+01:00")), true),
            (Condition::new("causation_id", ConditionOp::Exists, Value::Null), false),
            (Condition::new("causation_id", ConditionOp::Exists, json!(false)), true),
            (Condition::new("missing.path", ConditionOp::Ne, json!("x")), false),
        ];
        for (condition, expected) in cases {
            assert_eq!(condition.matches(&fields), expected, "{condition:?}");
        }
    }

    #[test]
    fn test_time_constraint_window() {
        let constraint = TimeConstraint {
            from: "event".into(),
            from_field: None,
            to: "decision".into(),
            to_field: None,
            min_hours: Some(0.0),
            max_hours: Some(72.0),
        };
        assert!(constraint.within(71.9));
        assert!(!constraint.within(72.1));
        assert!(!constraint.within(-1.0));
    }

    #[test]
    fn test_validate_rejects_bad_edges() {
        let query = ComplianceQuery {
            query_id: "q".into(),
            regulation: "GDPR".into(),
            article: "Art. 33".into(),
            description: String::new(),
            required_confidence: 1.0,
            nodes: vec![
                NodeFilter {
                    alias: "clock".into(),
                    kind: NodeKind::Clock,
                    conditions: vec![],
                    within_time_range: false,
                },
                NodeFilter {
                    alias: "event".into(),
                    kind: NodeKind::Event,
                    conditions: vec![],
                    within_time_range: true,
                },
            ],
            edges: vec![EdgeRequirement {
                edge_type: EdgeType::Triggers,
                from: "clock".into(),
                to: "event".into(),
                optional: false,
            }],
            time_constraints: vec![],
            criteria: vec![ProofCriterion {
                id: "c".into(),
                description: "clock exists".into(),
                weight: 1.0,
                mandatory: true,
                recommendation: None,
                check: CriterionCheck::Exists {
                    alias: "clock".into(),
                },
            }],
        };
        assert!(query.validate().is_err());
    }
}
