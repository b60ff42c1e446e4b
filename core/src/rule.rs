use crate::error::ValidationError;
use crate::schema::ColumnType;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user-declared rule: the root group of a nested AND/OR tree.
///
/// Trees arrive as JSON from the authoring surface:
///
/// ```
/// use sieve_core::rule::RuleTree;
///
/// let tree = RuleTree::from_json(r#"{
///     "combinator": "and",
///     "rules": [
///         { "field": "age", "operator": "greater_than_or_equal", "value": 18 },
///         { "combinator": "or", "rules": [
///             { "field": "status", "operator": "equals", "value": "active" },
///             { "field": "email", "operator": "is_not_null", "value": null }
///         ]}
///     ]
/// }"#).unwrap();
/// assert_eq!(tree.leaf_count(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleTree {
    pub root: RuleGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RuleNode {
    Group(RuleGroup),
    Leaf(RuleLeaf),
}

/// An object with `combinator` or `rules` is a group; anything else is a leaf.
/// Dispatching on keys keeps the leaf's own error (such as an unknown
/// operator) instead of a generic "no variant matched".
impl<'de> Deserialize<'de> for RuleNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let is_group = value
            .as_object()
            .is_some_and(|o| o.contains_key("combinator") || o.contains_key("rules"));
        let node = if is_group {
            RuleGroup::deserialize(value).map(RuleNode::Group)
        } else {
            RuleLeaf::deserialize(value).map(RuleNode::Leaf)
        };
        node.map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleGroup {
    pub combinator: Combinator,
    pub rules: Vec<RuleNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleLeaf {
    pub field: String,
    pub operator: OperatorKind,
    #[serde(default)]
    pub value: Option<RawValue>,
}

/// Accepted in any letter case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

impl<'de> Deserialize<'de> for Combinator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "and" => Ok(Combinator::And),
            "or" => Ok(Combinator::Or),
            _ => Err(de::Error::custom(format!(
                "unknown combinator '{raw}', expected 'and' or 'or'"
            ))),
        }
    }
}

/// Loosely typed value as authored; coerced to a column type at compile time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Bool(b) => write!(f, "{b}"),
            RawValue::Number(n) => write!(f, "{n}"),
            RawValue::Text(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Serialized in snake case; parsed in any letter case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    IsNull,
    IsNotNull,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 12] = [
        OperatorKind::Equals,
        OperatorKind::NotEquals,
        OperatorKind::Contains,
        OperatorKind::NotContains,
        OperatorKind::StartsWith,
        OperatorKind::EndsWith,
        OperatorKind::GreaterThan,
        OperatorKind::GreaterThanOrEqual,
        OperatorKind::LessThan,
        OperatorKind::LessThanOrEqual,
        OperatorKind::IsNull,
        OperatorKind::IsNotNull,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperatorKind::Equals => "equals",
            OperatorKind::NotEquals => "not_equals",
            OperatorKind::Contains => "contains",
            OperatorKind::NotContains => "not_contains",
            OperatorKind::StartsWith => "starts_with",
            OperatorKind::EndsWith => "ends_with",
            OperatorKind::GreaterThan => "greater_than",
            OperatorKind::GreaterThanOrEqual => "greater_than_or_equal",
            OperatorKind::LessThan => "less_than",
            OperatorKind::LessThanOrEqual => "less_than_or_equal",
            OperatorKind::IsNull => "is_null",
            OperatorKind::IsNotNull => "is_not_null",
        }
    }

    /// Unary operators look only at nullness and ignore any supplied value.
    pub fn is_unary(self) -> bool {
        matches!(self, OperatorKind::IsNull | OperatorKind::IsNotNull)
    }

    pub fn applies_to(self, column_type: ColumnType) -> bool {
        match self {
            OperatorKind::Equals
            | OperatorKind::NotEquals
            | OperatorKind::Contains
            | OperatorKind::NotContains
            | OperatorKind::StartsWith
            | OperatorKind::EndsWith => column_type == ColumnType::Text,
            OperatorKind::GreaterThan
            | OperatorKind::GreaterThanOrEqual
            | OperatorKind::LessThan
            | OperatorKind::LessThanOrEqual => {
                matches!(column_type, ColumnType::Number | ColumnType::Date)
            }
            OperatorKind::IsNull | OperatorKind::IsNotNull => true,
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        OperatorKind::ALL
            .into_iter()
            .find(|op| op.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = OperatorKind::ALL.iter().map(|op| op.as_str()).collect();
                format!("unknown operator '{s}', expected one of: {}", known.join(", "))
            })
    }
}

impl<'de> Deserialize<'de> for OperatorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

impl RuleTree {
    pub fn new(root: RuleGroup) -> Self {
        Self { root }
    }

    /// Parse the authoring-surface JSON payload.
    ///
    /// Only shape is checked here; field names, operator applicability and
    /// values are checked by the compiler against a dataset schema.
    pub fn from_json(payload: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn from_value(payload: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    pub fn leaf_count(&self) -> usize {
        self.root.leaf_count()
    }

    /// Nesting depth, with the root group at depth 1.
    pub fn depth(&self) -> usize {
        self.root.depth()
    }
}

impl RuleGroup {
    pub fn new(combinator: Combinator, rules: Vec<RuleNode>) -> Self {
        Self { combinator, rules }
    }

    pub fn and(rules: Vec<RuleNode>) -> Self {
        Self::new(Combinator::And, rules)
    }

    pub fn or(rules: Vec<RuleNode>) -> Self {
        Self::new(Combinator::Or, rules)
    }

    fn leaf_count(&self) -> usize {
        self.rules
            .iter()
            .map(|node| match node {
                RuleNode::Group(group) => group.leaf_count(),
                RuleNode::Leaf(_) => 1,
            })
            .sum()
    }

    fn depth(&self) -> usize {
        1 + self
            .rules
            .iter()
            .map(|node| match node {
                RuleNode::Group(group) => group.depth(),
                RuleNode::Leaf(_) => 0,
            })
            .max()
            .unwrap_or(0)
    }
}

impl RuleLeaf {
    pub fn new(field: impl Into<String>, operator: OperatorKind, value: Option<RawValue>) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

impl From<RuleLeaf> for RuleNode {
    fn from(leaf: RuleLeaf) -> Self {
        RuleNode::Leaf(leaf)
    }
}

impl From<RuleGroup> for RuleNode {
    fn from(group: RuleGroup) -> Self {
        RuleNode::Group(group)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(n: f64) -> Self {
        RawValue::Number(n)
    }
}

impl From<i64> for RawValue {
    fn from(n: i64) -> Self {
        RawValue::Number(n as f64)
    }
}
