use crate::coercion::{Scalar, TypeCoercionResolver};
use crate::error::{CompileError, ValidationError};
use crate::predicate::{fold_case, ColumnRef, CompiledPredicate, Comparison, PredicateNode, Test};
use crate::rule::{Combinator, OperatorKind, RuleGroup, RuleLeaf, RuleNode, RuleTree};
use crate::schema::DatasetSchema;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Validates rule trees against a dataset schema and produces typed predicates.
///
/// Compilation never reads data. Every problem it can find (unknown fields,
/// operators used on the wrong column type, values that do not coerce,
/// malformed groups) is reported here so that execution never has to.
#[derive(Debug, Clone)]
pub struct RuleCompiler {
    resolver: Arc<TypeCoercionResolver>,
    max_depth: usize,
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new(Arc::new(TypeCoercionResolver::default()), DEFAULT_MAX_DEPTH)
    }
}

impl RuleCompiler {
    pub fn new(resolver: Arc<TypeCoercionResolver>, max_depth: usize) -> Self {
        Self {
            resolver,
            max_depth,
        }
    }

    pub fn resolver(&self) -> &Arc<TypeCoercionResolver> {
        &self.resolver
    }

    pub fn compile(
        &self,
        tree: &RuleTree,
        schema: &DatasetSchema,
    ) -> Result<CompiledPredicate, CompileError> {
        // A root without rules selects nothing; submission rejects it.
        if tree.root.rules.is_empty() {
            return Ok(CompiledPredicate::new(
                PredicateNode::Any(Vec::new()),
                Arc::clone(&self.resolver),
                0,
            ));
        }

        let mut leaves = 0;
        let root = self.compile_group(&tree.root, schema, 1, "$", &mut leaves)?;
        debug!(
            dataset_id = %schema.dataset_id,
            leaves,
            "Compiled rule tree"
        );
        Ok(CompiledPredicate::new(root, Arc::clone(&self.resolver), leaves))
    }

    fn compile_group(
        &self,
        group: &RuleGroup,
        schema: &DatasetSchema,
        depth: usize,
        path: &str,
        leaves: &mut usize,
    ) -> Result<PredicateNode, CompileError> {
        if depth > self.max_depth {
            return Err(ValidationError::DepthExceeded {
                max_depth: self.max_depth,
            }
            .into());
        }
        if group.rules.is_empty() {
            return Err(ValidationError::EmptyGroup {
                path: path.to_string(),
            }
            .into());
        }

        let mut children = Vec::with_capacity(group.rules.len());
        for (i, node) in group.rules.iter().enumerate() {
            let child_path = format!("{path}.rules[{i}]");
            let child = match node {
                RuleNode::Group(inner) => {
                    self.compile_group(inner, schema, depth + 1, &child_path, leaves)?
                }
                RuleNode::Leaf(leaf) => {
                    *leaves += 1;
                    self.compile_leaf(leaf, schema, &child_path)?
                }
            };
            children.push(child);
        }

        Ok(match group.combinator {
            Combinator::And => PredicateNode::All(children),
            Combinator::Or => PredicateNode::Any(children),
        })
    }

    fn compile_leaf(
        &self,
        leaf: &RuleLeaf,
        schema: &DatasetSchema,
        path: &str,
    ) -> Result<PredicateNode, CompileError> {
        let (index, column) =
            schema
                .column(&leaf.field)
                .ok_or_else(|| ValidationError::UnknownField {
                    field: leaf.field.clone(),
                    path: path.to_string(),
                })?;

        let not_applicable = || ValidationError::OperatorNotApplicable {
            field: leaf.field.clone(),
            operator: leaf.operator,
            column_type: column.column_type,
            path: path.to_string(),
        };

        if !leaf.operator.applies_to(column.column_type) {
            return Err(not_applicable().into());
        }

        let column_ref = ColumnRef {
            index,
            name: column.name.clone(),
            column_type: column.column_type,
        };

        if leaf.operator.is_unary() {
            if leaf.value.is_some() {
                debug!(field = %leaf.field, operator = %leaf.operator, path, "Ignoring value on unary operator");
            }
            let test = if leaf.operator == OperatorKind::IsNull {
                Test::IsNull
            } else {
                Test::IsNotNull
            };
            return Ok(PredicateNode::Compare(Comparison {
                column: column_ref,
                test,
            }));
        }

        let raw = leaf.value.as_ref().ok_or_else(|| ValidationError::MissingValue {
            field: leaf.field.clone(),
            operator: leaf.operator,
            path: path.to_string(),
        })?;
        let value = self.resolver.coerce(&leaf.field, raw, column.column_type)?;

        let test = match (leaf.operator, value) {
            (OperatorKind::Equals, Scalar::Text(s)) => Test::Equals(fold_case(&s)),
            (OperatorKind::NotEquals, Scalar::Text(s)) => Test::NotEquals(fold_case(&s)),
            (OperatorKind::Contains, Scalar::Text(s)) => Test::Contains(fold_case(&s)),
            (OperatorKind::NotContains, Scalar::Text(s)) => Test::NotContains(fold_case(&s)),
            (OperatorKind::StartsWith, Scalar::Text(s)) => Test::StartsWith(fold_case(&s)),
            (OperatorKind::EndsWith, Scalar::Text(s)) => Test::EndsWith(fold_case(&s)),
            (OperatorKind::GreaterThan, bound) => Test::GreaterThan(bound),
            (OperatorKind::GreaterThanOrEqual, bound) => Test::GreaterThanOrEqual(bound),
            (OperatorKind::LessThan, bound) => Test::LessThan(bound),
            (OperatorKind::LessThanOrEqual, bound) => Test::LessThanOrEqual(bound),
            _ => return Err(not_applicable().into()),
        };

        Ok(PredicateNode::Compare(Comparison {
            column: column_ref,
            test,
        }))
    }
}
