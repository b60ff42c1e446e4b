//! Compiled, schema-typed predicate shared by preview and streaming execution.
//!
//! A `CompiledPredicate` mirrors the rule tree it was compiled from: groups
//! become `All`/`Any` nodes and leaves become typed `Comparison`s whose rule
//! values were coerced at compile time. Row evaluation is defined once here;
//! both execution contexts go through [`CompiledPredicate::evaluate`].

use crate::coercion::{Cell, InvalidCell, Scalar, TypeCoercionResolver};
use crate::schema::ColumnType;
use std::cmp::Ordering;
use std::sync::Arc;

/// Where to find a field in a row, by name or by position.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub index: usize,
    pub name: String,
    pub column_type: ColumnType,
}

/// Read access to one logical row.
pub trait RowAccess {
    fn cell(&self, column: &ColumnRef) -> Cell<'_>;
}

/// How a non-null row value that cannot be read as its column type is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidValues {
    /// The comparison is simply false.
    NonMatching,
    /// Evaluation stops with a `RowError`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub column: String,
    pub value: String,
    pub expected: ColumnType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateNode {
    All(Vec<PredicateNode>),
    Any(Vec<PredicateNode>),
    Compare(Comparison),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: ColumnRef,
    pub test: Test,
}

/// One variant per operator. Text needles are stored case-folded.
#[derive(Debug, Clone, PartialEq)]
pub enum Test {
    Equals(String),
    NotEquals(String),
    Contains(String),
    NotContains(String),
    StartsWith(String),
    EndsWith(String),
    GreaterThan(Scalar),
    GreaterThanOrEqual(Scalar),
    LessThan(Scalar),
    LessThanOrEqual(Scalar),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
pub struct CompiledPredicate {
    root: PredicateNode,
    resolver: Arc<TypeCoercionResolver>,
    leaf_count: usize,
}

impl CompiledPredicate {
    pub(crate) fn new(
        root: PredicateNode,
        resolver: Arc<TypeCoercionResolver>,
        leaf_count: usize,
    ) -> Self {
        Self {
            root,
            resolver,
            leaf_count,
        }
    }

    pub fn root(&self) -> &PredicateNode {
        &self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// True for a predicate compiled from a tree with no conditions. Such a
    /// predicate selects nothing and must not be submitted as a job.
    pub fn selects_nothing(&self) -> bool {
        self.leaf_count == 0
    }

    /// The single row decision used by every execution context.
    pub fn evaluate<R: RowAccess + ?Sized>(
        &self,
        row: &R,
        invalid: InvalidValues,
    ) -> Result<bool, RowError> {
        self.root.evaluate(row, &self.resolver, invalid)
    }

    /// Lenient decision: unreadable values never match.
    pub fn matches<R: RowAccess + ?Sized>(&self, row: &R) -> bool {
        // NonMatching never produces an error.
        self.evaluate(row, InvalidValues::NonMatching)
            .unwrap_or(false)
    }
}

impl PredicateNode {
    fn evaluate<R: RowAccess + ?Sized>(
        &self,
        row: &R,
        resolver: &TypeCoercionResolver,
        invalid: InvalidValues,
    ) -> Result<bool, RowError> {
        match self {
            PredicateNode::All(children) => {
                for child in children {
                    if !child.evaluate(row, resolver, invalid)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            PredicateNode::Any(children) => {
                for child in children {
                    if child.evaluate(row, resolver, invalid)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PredicateNode::Compare(comparison) => comparison.evaluate(row, resolver, invalid),
        }
    }
}

impl Comparison {
    fn evaluate<R: RowAccess + ?Sized>(
        &self,
        row: &R,
        resolver: &TypeCoercionResolver,
        invalid: InvalidValues,
    ) -> Result<bool, RowError> {
        let cell = row.cell(&self.column);
        match self.test {
            Test::IsNull => return Ok(cell.is_null()),
            Test::IsNotNull => return Ok(!cell.is_null()),
            _ => {}
        }

        let value = match resolver.coerce_cell(&cell, self.column.column_type) {
            Ok(Some(value)) => value,
            Ok(None) => return Ok(false),
            Err(InvalidCell) => {
                return match invalid {
                    InvalidValues::NonMatching => Ok(false),
                    InvalidValues::Reject => Err(RowError {
                        column: self.column.name.clone(),
                        value: cell.render().into_owned(),
                        expected: self.column.column_type,
                    }),
                }
            }
        };

        Ok(self.test.apply(&value))
    }
}

impl Test {
    /// Apply to a non-null value already coerced to the column's type.
    fn apply(&self, value: &Scalar) -> bool {
        match self {
            Test::Equals(needle) => folded(value).is_some_and(|v| v == *needle),
            Test::NotEquals(needle) => folded(value).is_some_and(|v| v != *needle),
            Test::Contains(needle) => folded(value).is_some_and(|v| v.contains(needle.as_str())),
            Test::NotContains(needle) => {
                folded(value).is_some_and(|v| !v.contains(needle.as_str()))
            }
            Test::StartsWith(needle) => {
                folded(value).is_some_and(|v| v.starts_with(needle.as_str()))
            }
            Test::EndsWith(needle) => folded(value).is_some_and(|v| v.ends_with(needle.as_str())),
            Test::GreaterThan(bound) => value.partial_cmp_ordinal(bound) == Some(Ordering::Greater),
            Test::GreaterThanOrEqual(bound) => matches!(
                value.partial_cmp_ordinal(bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Test::LessThan(bound) => value.partial_cmp_ordinal(bound) == Some(Ordering::Less),
            Test::LessThanOrEqual(bound) => matches!(
                value.partial_cmp_ordinal(bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Test::IsNull => false,
            Test::IsNotNull => true,
        }
    }
}

pub(crate) fn fold_case(s: &str) -> String {
    s.to_lowercase()
}

fn folded(value: &Scalar) -> Option<String> {
    match value {
        Scalar::Text(s) => Some(fold_case(s)),
        _ => None,
    }
}
