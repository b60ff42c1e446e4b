//! Storage adapters: chunked dataset readers and staged, atomically committed
//! output.

use crate::error::ExecutionError;
use crate::job::JobId;
use crate::preview::PreviewSample;
use crate::schema::DatasetSchema;
use arrow::array::{Array, StringArray};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Sequential chunks of a dataset. Each item holds at most the requested
/// number of rows.
pub type ChunkReader = Box<dyn Iterator<Item = Result<RecordBatch, ExecutionError>> + Send>;

pub trait DatasetSource: Send + Sync {
    fn open(&self, schema: &DatasetSchema, chunk_rows: usize)
        -> Result<ChunkReader, ExecutionError>;
}

/// Handle to a committed output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputRef(pub String);

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output being written for one job. Dropping it without calling `commit`
/// discards everything written so far.
pub trait StagedOutput: Send {
    fn write(&mut self, batch: &RecordBatch) -> Result<(), ExecutionError>;
    fn commit(self: Box<Self>) -> Result<OutputRef, ExecutionError>;
}

pub trait OutputSink: Send + Sync {
    fn stage(&self, job_id: &JobId, schema: SchemaRef)
        -> Result<Box<dyn StagedOutput>, ExecutionError>;

    /// Remove a committed artifact whose job could not be recorded as
    /// completed.
    fn discard(&self, output: &OutputRef) -> Result<(), ExecutionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Ndjson,
    /// Snappy-compressed columnar file.
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Ndjson => "ndjson",
            OutputFormat::Parquet => "parquet",
        }
    }
}

/// Reads delimited text files with a header row. Storage references are paths,
/// resolved against `root` when relative.
#[derive(Debug, Clone, Default)]
pub struct CsvDatasetSource {
    root: Option<PathBuf>,
}

impl CsvDatasetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, schema: &DatasetSchema) -> PathBuf {
        let path = Path::new(&schema.storage.0);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn check_header(&self, path: &Path, schema: &DatasetSchema) -> Result<(), ExecutionError> {
        let file = File::open(path)?;
        let (found, _) = arrow::csv::reader::Format::default()
            .with_header(true)
            .infer_schema(BufReader::new(file), Some(0))
            .map_err(|source| ExecutionError::Decode { chunk: 0, source })?;

        let found: Vec<&str> = found.fields().iter().map(|f| f.name().as_str()).collect();
        let expected: Vec<&str> = schema.columns().iter().map(|c| c.name.as_str()).collect();
        if found != expected {
            return Err(ExecutionError::HeaderMismatch {
                expected: expected.join(","),
                found: found.join(","),
            });
        }
        Ok(())
    }

    /// Read the first `limit` rows into the preview sample shape. Only the
    /// first chunk is decoded.
    pub fn sample(
        &self,
        schema: &DatasetSchema,
        limit: usize,
    ) -> Result<PreviewSample, ExecutionError> {
        let mut reader = self.open(schema, limit.max(1))?;
        let columns: Vec<String> = schema.columns().iter().map(|c| c.name.clone()).collect();

        let mut rows = Vec::new();
        if let Some(batch) = reader.next().transpose()? {
            for row in 0..batch.num_rows().min(limit) {
                let mut record = serde_json::Map::with_capacity(columns.len());
                for (i, name) in columns.iter().enumerate() {
                    let value = batch
                        .column(i)
                        .as_any()
                        .downcast_ref::<StringArray>()
                        .filter(|array| !array.is_null(row))
                        .map_or(serde_json::Value::Null, |array| {
                            serde_json::Value::String(array.value(row).to_string())
                        });
                    record.insert(name.clone(), value);
                }
                rows.push(record);
            }
        }

        Ok(PreviewSample {
            total_columns: columns.len(),
            columns,
            rows,
            row_count: schema.row_count,
        })
    }
}

impl DatasetSource for CsvDatasetSource {
    fn open(
        &self,
        schema: &DatasetSchema,
        chunk_rows: usize,
    ) -> Result<ChunkReader, ExecutionError> {
        let path = self.resolve(schema);
        if !path.is_file() {
            return Err(ExecutionError::UnknownStorage(schema.storage.to_string()));
        }
        self.check_header(&path, schema)?;

        let reader = arrow::csv::ReaderBuilder::new(schema.raw_arrow_schema())
            .with_header(true)
            .with_batch_size(chunk_rows)
            .build(File::open(&path)?)
            .map_err(|source| ExecutionError::Decode { chunk: 0, source })?;

        debug!(path = %path.display(), chunk_rows, "Opened dataset");
        Ok(Box::new(reader.enumerate().map(|(chunk, batch)| {
            batch.map_err(|source| ExecutionError::Decode { chunk, source })
        })))
    }
}

/// Writes job output next to its final location and renames it into place
/// on commit.
#[derive(Debug, Clone)]
pub struct LocalOutputSink {
    dir: PathBuf,
    format: OutputFormat,
}

impl LocalOutputSink {
    pub fn new(dir: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn final_path(&self, job_id: &JobId) -> PathBuf {
        self.dir
            .join(format!("{job_id}.{}", self.format.extension()))
    }
}

impl OutputSink for LocalOutputSink {
    fn stage(
        &self,
        job_id: &JobId,
        schema: SchemaRef,
    ) -> Result<Box<dyn StagedOutput>, ExecutionError> {
        std::fs::create_dir_all(&self.dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!(".{job_id}-"))
            .suffix(".partial")
            .tempfile_in(&self.dir)?;
        let buffered = BufWriter::new(file);

        let writer = match self.format {
            OutputFormat::Csv => FormatWriter::Csv(
                arrow::csv::WriterBuilder::new()
                    .with_header(true)
                    .build(buffered),
            ),
            OutputFormat::Ndjson => {
                FormatWriter::Ndjson(arrow_json::LineDelimitedWriter::new(buffered))
            }
            OutputFormat::Parquet => {
                let props = WriterProperties::builder()
                    .set_compression(Compression::SNAPPY)
                    .build();
                FormatWriter::Parquet(ArrowWriter::try_new(buffered, schema, Some(props))?)
            }
        };

        Ok(Box::new(LocalStagedOutput {
            writer,
            final_path: self.final_path(job_id),
        }))
    }

    fn discard(&self, output: &OutputRef) -> Result<(), ExecutionError> {
        match std::fs::remove_file(&output.0) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

enum FormatWriter {
    Csv(arrow::csv::Writer<BufWriter<NamedTempFile>>),
    Ndjson(arrow_json::LineDelimitedWriter<BufWriter<NamedTempFile>>),
    Parquet(ArrowWriter<BufWriter<NamedTempFile>>),
}

struct LocalStagedOutput {
    writer: FormatWriter,
    final_path: PathBuf,
}

impl StagedOutput for LocalStagedOutput {
    fn write(&mut self, batch: &RecordBatch) -> Result<(), ExecutionError> {
        match &mut self.writer {
            FormatWriter::Csv(w) => w.write(batch).map_err(ExecutionError::Write),
            FormatWriter::Ndjson(w) => w.write(batch).map_err(ExecutionError::Write),
            FormatWriter::Parquet(w) => Ok(w.write(batch)?),
        }
    }

    fn commit(self: Box<Self>) -> Result<OutputRef, ExecutionError> {
        let mut buffered = match self.writer {
            FormatWriter::Csv(w) => w.into_inner(),
            FormatWriter::Ndjson(mut w) => {
                w.finish().map_err(ExecutionError::Write)?;
                w.into_inner()
            }
            // Writes the footer.
            FormatWriter::Parquet(w) => w.into_inner()?,
        };
        buffered.flush()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.as_file().sync_all()?;
        file.persist(&self.final_path)?;

        debug!(path = %self.final_path.display(), "Committed output");
        Ok(OutputRef(self.final_path.display().to_string()))
    }
}
