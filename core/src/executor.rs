//! Chunked execution of a compiled predicate over a full dataset.
//!
//! Only one chunk is held in memory at a time. Surviving rows go to a staged
//! output that is committed only when every chunk has been processed; any
//! error or cancellation drops it instead.

use crate::coercion::Cell;
use crate::error::ExecutionError;
use crate::job::JobId;
use crate::metrics::METRICS;
use crate::predicate::{ColumnRef, CompiledPredicate, InvalidValues, RowAccess};
use crate::schema::DatasetSchema;
use crate::storage::{DatasetSource, OutputRef, OutputSink};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative cancellation signal, observed between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub rows_scanned: u64,
    pub rows_written: u64,
    pub chunks: u64,
    pub output_ref: OutputRef,
}

impl ExecutionReport {
    pub fn rows_filtered(&self) -> u64 {
        self.rows_scanned - self.rows_written
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed(ExecutionReport),
    Cancelled { chunks_processed: u64 },
}

#[derive(Clone)]
pub struct StreamingExecutor {
    source: Arc<dyn DatasetSource>,
    chunk_rows: usize,
    invalid: InvalidValues,
}

impl StreamingExecutor {
    /// Row values that cannot be read as their column type fail the job.
    pub fn new(source: Arc<dyn DatasetSource>, chunk_rows: usize) -> Self {
        Self {
            source,
            chunk_rows: chunk_rows.max(1),
            invalid: InvalidValues::Reject,
        }
    }

    pub fn with_invalid_values(mut self, invalid: InvalidValues) -> Self {
        self.invalid = invalid;
        self
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    /// Stream `schema`'s dataset through `predicate`, writing matching rows to
    /// `sink`. Runs on the blocking pool.
    pub async fn execute(
        &self,
        job_id: JobId,
        predicate: Arc<CompiledPredicate>,
        schema: Arc<DatasetSchema>,
        sink: Arc<dyn OutputSink>,
        cancel: CancelFlag,
    ) -> Result<StreamOutcome, ExecutionError> {
        let executor = self.clone();
        tokio::task::spawn_blocking(move || {
            executor.stream(&job_id, &predicate, &schema, sink.as_ref(), &cancel)
        })
        .await
        .map_err(|e| ExecutionError::Aborted(e.to_string()))?
    }

    /// Synchronous body of [`execute`](Self::execute).
    pub fn stream(
        &self,
        job_id: &JobId,
        predicate: &CompiledPredicate,
        schema: &DatasetSchema,
        sink: &dyn OutputSink,
        cancel: &CancelFlag,
    ) -> Result<StreamOutcome, ExecutionError> {
        let mut reader = self.source.open(schema, self.chunk_rows)?;
        let mut staged = sink.stage(job_id, schema.raw_arrow_schema())?;

        let mut rows_scanned = 0u64;
        let mut rows_written = 0u64;
        let mut chunks = 0u64;

        loop {
            if cancel.is_cancelled() {
                info!(job_id = %job_id, chunks, "Cancellation observed, discarding output");
                return Ok(StreamOutcome::Cancelled {
                    chunks_processed: chunks,
                });
            }
            let Some(batch) = reader.next() else {
                break;
            };
            let batch = batch?;
            let started = Instant::now();

            let mask = filter_mask(predicate, &batch, self.invalid, rows_scanned)?;
            let kept = filter_record_batch(&batch, &mask).map_err(|source| {
                ExecutionError::Decode {
                    chunk: chunks as usize,
                    source,
                }
            })?;
            // Empty batches are still written so a CSV header is always emitted.
            staged.write(&kept)?;

            let scanned = batch.num_rows() as u64;
            let written = kept.num_rows() as u64;
            rows_scanned += scanned;
            rows_written += written;
            METRICS.record_chunk(scanned, written, started.elapsed().as_secs_f64());
            debug!(
                job_id = %job_id,
                chunk = chunks,
                rows = scanned,
                kept = written,
                "Processed chunk"
            );
            chunks += 1;
        }

        if cancel.is_cancelled() {
            info!(job_id = %job_id, chunks, "Cancellation observed before commit");
            return Ok(StreamOutcome::Cancelled {
                chunks_processed: chunks,
            });
        }

        if chunks == 0 {
            // A dataset with only a header still yields a headed output.
            staged.write(&RecordBatch::new_empty(schema.raw_arrow_schema()))?;
        }

        let output_ref = staged.commit()?;
        Ok(StreamOutcome::Completed(ExecutionReport {
            rows_scanned,
            rows_written,
            chunks,
            output_ref,
        }))
    }
}

/// One boolean per row of `batch`. `first_row` is the number of rows already
/// scanned before this batch, used to report 1-based row numbers.
pub fn filter_mask(
    predicate: &CompiledPredicate,
    batch: &RecordBatch,
    invalid: InvalidValues,
    first_row: u64,
) -> Result<BooleanArray, ExecutionError> {
    let columns = batch.columns();
    let mut mask = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let keep = predicate
            .evaluate(&BatchRow { columns, row }, invalid)
            .map_err(|e| {
                let row = first_row + row as u64 + 1;
                warn!(row, column = %e.column, value = %e.value, "Malformed row value");
                ExecutionError::MalformedRow {
                    row,
                    column: e.column,
                    value: e.value,
                    expected: e.expected,
                }
            })?;
        mask.push(keep);
    }
    Ok(BooleanArray::from(mask))
}

/// A row inside a record batch. Columns are addressed by schema position.
struct BatchRow<'a> {
    columns: &'a [ArrayRef],
    row: usize,
}

impl RowAccess for BatchRow<'_> {
    fn cell(&self, column: &ColumnRef) -> Cell<'_> {
        let Some(array) = self.columns.get(column.index) else {
            return Cell::Null;
        };
        if array.is_null(self.row) {
            return Cell::Null;
        }

        let any = array.as_any();
        if let Some(values) = any.downcast_ref::<StringArray>() {
            return Cell::from_text(values.value(self.row));
        }
        if let Some(values) = any.downcast_ref::<Float64Array>() {
            return Cell::Number(values.value(self.row));
        }
        if let Some(values) = any.downcast_ref::<Int64Array>() {
            return Cell::Number(values.value(self.row) as f64);
        }
        if let Some(values) = any.downcast_ref::<BooleanArray>() {
            return Cell::Bool(values.value(self.row));
        }
        match array_value_to_string(array.as_ref(), self.row) {
            Ok(s) if !s.is_empty() => Cell::Text(Cow::Owned(s)),
            _ => Cell::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::rule::RuleTree;
    use crate::schema::{Column, ColumnType, StorageRef};
    use crate::storage::{ChunkReader, CsvDatasetSource, LocalOutputSink, OutputFormat};
    use serde_json::json;
    use std::path::Path;
    use tempfile::tempdir;

    fn schema(path: &Path) -> DatasetSchema {
        DatasetSchema::try_new(
            "people",
            vec![
                Column::new("name", ColumnType::Text),
                Column::new("age", ColumnType::Number),
                Column::new("status", ColumnType::Text),
            ],
            None,
            StorageRef(path.display().to_string()),
        )
        .unwrap()
    }

    fn adults(schema: &DatasetSchema) -> CompiledPredicate {
        let tree = RuleTree::from_value(json!({"combinator": "and", "rules": [
            {"field": "age", "operator": "greater_than_or_equal", "value": 18},
            {"field": "status", "operator": "equals", "value": "active"}
        ]}))
        .unwrap();
        RuleCompiler::default().compile(&tree, schema).unwrap()
    }

    fn write_csv(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("people.csv");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_streams_matching_rows() {
        let dir = tempdir().unwrap();
        let path = write_csv(
            dir.path(),
            "name,age,status\nana,17,active\nben,25,Active\ncai,30,inactive\ndee,,active\neli,41,ACTIVE\n",
        );
        let schema = schema(&path);
        let sink = LocalOutputSink::new(dir.path().join("out"), OutputFormat::Csv);
        let executor = StreamingExecutor::new(Arc::new(CsvDatasetSource::new()), 2);

        let outcome = executor
            .stream(&JobId::new(), &adults(&schema), &schema, &sink, &CancelFlag::new())
            .unwrap();
        let StreamOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.rows_scanned, 5);
        assert_eq!(report.rows_written, 2);
        assert_eq!(report.rows_filtered(), 3);
        assert_eq!(report.chunks, 3);
        assert_eq!(
            std::fs::read_to_string(&report.output_ref.0).unwrap(),
            "name,age,status\nben,25,Active\neli,41,ACTIVE\n"
        );
    }

    #[test]
    fn test_header_only_dataset_keeps_header() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "name,age,status\n");
        let schema = schema(&path);
        let sink = LocalOutputSink::new(dir.path().join("out"), OutputFormat::Csv);

        let outcome = StreamingExecutor::new(Arc::new(CsvDatasetSource::new()), 4)
            .stream(&JobId::new(), &adults(&schema), &schema, &sink, &CancelFlag::new())
            .unwrap();
        let StreamOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!((report.rows_scanned, report.chunks), (0, 0));
        assert_eq!(
            std::fs::read_to_string(&report.output_ref.0).unwrap(),
            "name,age,status\n"
        );
    }

    #[test]
    fn test_malformed_row_fails_and_discards() {
        let dir = tempdir().unwrap();
        let path = write_csv(dir.path(), "name,age,status\nana,40,active\nben,old,active\n");
        let schema = schema(&path);
        let out = dir.path().join("out");
        let sink = LocalOutputSink::new(&out, OutputFormat::Csv);
        let executor = StreamingExecutor::new(Arc::new(CsvDatasetSource::new()), 1);

        let err = executor
            .stream(&JobId::new(), &adults(&schema), &schema, &sink, &CancelFlag::new())
            .unwrap_err();
        match err {
            ExecutionError::MalformedRow { row, column, value, .. } => {
                assert_eq!(row, 2);
                assert_eq!(column, "age");
                assert_eq!(value, "old");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);

        let lenient = executor.with_invalid_values(InvalidValues::NonMatching);
        let outcome = lenient
            .stream(&JobId::new(), &adults(&schema), &schema, &sink, &CancelFlag::new())
            .unwrap();
        assert!(matches!(
            outcome,
            StreamOutcome::Completed(ExecutionReport { rows_written: 1, .. })
        ));
    }

    struct CancellingSource {
        batches: Vec<RecordBatch>,
        cancel: CancelFlag,
    }

    impl DatasetSource for CancellingSource {
        fn open(&self, _: &DatasetSchema, _: usize) -> Result<ChunkReader, ExecutionError> {
            let cancel = self.cancel.clone();
            Ok(Box::new(self.batches.clone().into_iter().enumerate().map(
                move |(i, batch)| {
                    if i == 1 {
                        cancel.cancel();
                    }
                    Ok::<_, ExecutionError>(batch)
                },
            )))
        }
    }

    #[test]
    fn test_cancellation_between_chunks() {
        let dir = tempdir().unwrap();
        let schema = schema(Path::new("unused.csv"));
        let batch = RecordBatch::try_new(
            schema.raw_arrow_schema(),
            vec![
                Arc::new(StringArray::from(vec!["ana"])),
                Arc::new(StringArray::from(vec!["30"])),
                Arc::new(StringArray::from(vec!["active"])),
            ],
        )
        .unwrap();
        let cancel = CancelFlag::new();
        let source = CancellingSource {
            batches: vec![batch.clone(), batch.clone(), batch],
            cancel: cancel.clone(),
        };
        let out = dir.path().join("out");
        let sink = LocalOutputSink::new(&out, OutputFormat::Ndjson);

        let outcome = StreamingExecutor::new(Arc::new(source), 1)
            .stream(&JobId::new(), &adults(&schema), &schema, &sink, &cancel)
            .unwrap();
        // The second chunk was already pulled when the flag flipped, so it is
        // processed; the third is never read.
        assert_eq!(outcome, StreamOutcome::Cancelled { chunks_processed: 2 });
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_typed_arrays_are_readable() {
        let schema = arrow::datatypes::Schema::new(vec![
            arrow::datatypes::Field::new("n", arrow::datatypes::DataType::Int64, true),
            arrow::datatypes::Field::new("f", arrow::datatypes::DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![Some(7), None])),
                Arc::new(Float64Array::from(vec![Some(1.5), Some(2.0)])),
            ],
        )
        .unwrap();
        let columns = batch.columns();
        let n = ColumnRef {
            index: 0,
            name: "n".into(),
            column_type: ColumnType::Number,
        };
        let f = ColumnRef {
            index: 1,
            name: "f".into(),
            column_type: ColumnType::Number,
        };
        assert_eq!(BatchRow { columns, row: 0 }.cell(&n), Cell::Number(7.0));
        assert_eq!(BatchRow { columns, row: 1 }.cell(&n), Cell::Null);
        assert_eq!(BatchRow { columns, row: 1 }.cell(&f), Cell::Number(2.0));
    }
}
