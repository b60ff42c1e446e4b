use crate::coercion::Cell;
use crate::predicate::{ColumnRef, CompiledPredicate, RowAccess};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_PREVIEW_ROWS: usize = 200;

/// Sample rows as delivered by the dataset sample fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewSample {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub total_columns: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewResult {
    pub matches: usize,
    pub total: usize,
}

/// Evaluates a predicate over a bounded in-memory sample.
///
/// Evaluation is read-only and deterministic. Row values that cannot be read
/// as their column's type count as non-matching; preview never fails on dirty
/// data.
#[derive(Debug, Clone)]
pub struct PreviewEvaluator {
    max_rows: usize,
}

impl Default for PreviewEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_ROWS)
    }
}

impl PreviewEvaluator {
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Rows past `max_rows` are not evaluated and not counted in `total`.
    pub fn evaluate(&self, predicate: &CompiledPredicate, sample: &PreviewSample) -> PreviewResult {
        let rows = &sample.rows[..sample.rows.len().min(self.max_rows)];
        let matches = rows
            .iter()
            .filter(|row| predicate.matches(&JsonRow(row)))
            .count();

        if rows.len() < sample.rows.len() {
            debug!(
                supplied = sample.rows.len(),
                evaluated = rows.len(),
                "Preview sample truncated"
            );
        }
        crate::metrics::METRICS.record_preview();

        PreviewResult {
            matches,
            total: rows.len(),
        }
    }

    /// Indices of matching rows within the evaluated part of the sample.
    pub fn matching_indices(
        &self,
        predicate: &CompiledPredicate,
        sample: &PreviewSample,
    ) -> Vec<usize> {
        sample
            .rows
            .iter()
            .take(self.max_rows)
            .enumerate()
            .filter(|(_, row)| predicate.matches(&JsonRow(row)))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Sample rows are keyed by column name.
pub(crate) struct JsonRow<'a>(pub(crate) &'a serde_json::Map<String, serde_json::Value>);

impl RowAccess for JsonRow<'_> {
    fn cell(&self, column: &ColumnRef) -> Cell<'_> {
        Cell::from_json(self.0.get(&column.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::rule::RuleTree;
    use crate::schema::{Column, ColumnType, DatasetSchema, StorageRef};
    use serde_json::json;

    fn sample(rows: serde_json::Value) -> PreviewSample {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_value(rows).unwrap();
        PreviewSample {
            columns: vec!["age".into(), "status".into()],
            row_count: Some(rows.len() as u64),
            total_columns: 2,
            rows,
        }
    }

    fn compile(rules: serde_json::Value) -> CompiledPredicate {
        let schema = DatasetSchema::try_new(
            "people",
            vec![
                Column::new("age", ColumnType::Number),
                Column::new("status", ColumnType::Text),
            ],
            None,
            StorageRef("people.csv".into()),
        )
        .unwrap();
        RuleCompiler::default()
            .compile(&RuleTree::from_value(rules).unwrap(), &schema)
            .unwrap()
    }

    #[test]
    fn test_and_combinator() {
        let predicate = compile(json!({"combinator": "and", "rules": [
            {"field": "age", "operator": "greater_than_or_equal", "value": 18},
            {"field": "status", "operator": "equals", "value": "active"}
        ]}));
        let rows = sample(json!([
            {"age": 17, "status": "active"},
            {"age": 25, "status": "active"},
            {"age": 30, "status": "inactive"}
        ]));

        let result = PreviewEvaluator::default().evaluate(&predicate, &rows);
        assert_eq!(result, PreviewResult { matches: 1, total: 3 });
        assert_eq!(
            PreviewEvaluator::default().matching_indices(&predicate, &rows),
            vec![1]
        );
    }

    #[test]
    fn test_null_never_matches_binary_comparison() {
        let predicate = compile(json!({"combinator": "and", "rules": [
            {"field": "age", "operator": "greater_than_or_equal", "value": 18}
        ]}));
        let rows = sample(json!([{"age": 17}, {"age": 25}, {"age": null}]));
        assert_eq!(PreviewEvaluator::default().evaluate(&predicate, &rows).matches, 1);
    }

    #[test]
    fn test_unary_ignores_value() {
        let with_value = compile(json!({"combinator": "and", "rules": [
            {"field": "status", "operator": "is_null", "value": "ignored"}
        ]}));
        let without_value = compile(json!({"combinator": "and", "rules": [
            {"field": "status", "operator": "is_null"}
        ]}));
        let rows = sample(json!([{"status": null}, {"status": "x"}, {"age": 3}]));

        let evaluator = PreviewEvaluator::default();
        assert_eq!(evaluator.evaluate(&with_value, &rows).matches, 2);
        assert_eq!(
            evaluator.evaluate(&with_value, &rows),
            evaluator.evaluate(&without_value, &rows)
        );
    }

    #[test]
    fn test_dirty_values_do_not_abort() {
        let predicate = compile(json!({"combinator": "or", "rules": [
            {"field": "age", "operator": "less_than", "value": "30"},
            {"field": "status", "operator": "contains", "value": "ACT"}
        ]}));
        let rows = sample(json!([
            {"age": "n/a", "status": "inactive"},
            {"age": "n/a", "status": "closed"},
            {"age": "29", "status": "closed"}
        ]));
        assert_eq!(
            PreviewEvaluator::default().evaluate(&predicate, &rows),
            PreviewResult { matches: 2, total: 3 }
        );
    }

    #[test]
    fn test_sample_is_capped() {
        let predicate = compile(json!({"combinator": "and", "rules": [
            {"field": "age", "operator": "is_not_null"}
        ]}));
        let rows = sample(json!([{"age": 1}, {"age": 2}, {"age": 3}, {"age": 4}]));
        assert_eq!(
            PreviewEvaluator::new(2).evaluate(&predicate, &rows),
            PreviewResult { matches: 2, total: 2 }
        );
    }
}
