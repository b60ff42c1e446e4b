use crate::coercion::DEFAULT_DATE_FORMATS;
use crate::compiler::DEFAULT_MAX_DEPTH;
use crate::predicate::InvalidValues;
use crate::preview::DEFAULT_PREVIEW_ROWS;
use crate::schema::{Column, DatasetSchema, StorageRef};
use crate::storage::OutputFormat;
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct SieveConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub coercion: CoercionConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Rows per streaming chunk. Bounds peak memory per running job.
    pub chunk_rows: usize,
    /// Worker pool size.
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_max_queued_jobs")]
    pub max_queued_jobs: usize, // Backpressure: submissions wait once this many jobs are queued
    #[serde(default = "default_max_rule_depth")]
    pub max_rule_depth: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub persistence_path: Option<String>, // None = in-memory job store
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub malformed_rows: MalformedRows,
}

fn default_max_queued_jobs() -> usize {
    64
}

fn default_max_rule_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// What streaming does with a row value that cannot be read as its column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedRows {
    #[default]
    Fail,
    Skip,
}

impl From<MalformedRows> for InvalidValues {
    fn from(policy: MalformedRows) -> Self {
        match policy {
            MalformedRows::Fail => InvalidValues::Reject,
            MalformedRows::Skip => InvalidValues::NonMatching,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    #[serde(default = "default_preview_rows")]
    pub max_rows: usize,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_rows: default_preview_rows(),
        }
    }
}

fn default_preview_rows() -> usize {
    DEFAULT_PREVIEW_ROWS
}

#[derive(Debug, Deserialize, Clone)]
pub struct CoercionConfig {
    #[serde(default = "default_date_formats")]
    pub date_formats: Vec<String>,
}

impl Default for CoercionConfig {
    fn default() -> Self {
        Self {
            date_formats: default_date_formats(),
        }
    }
}

fn default_date_formats() -> Vec<String> {
    DEFAULT_DATE_FORMATS.iter().map(|f| f.to_string()).collect()
}

/// A dataset known to the file-backed registry.
#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    pub id: String,
    pub path: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

impl DatasetConfig {
    pub fn to_schema(&self) -> Result<DatasetSchema> {
        DatasetSchema::try_new(
            self.id.clone(),
            self.columns.clone(),
            self.row_count,
            StorageRef(self.path.clone()),
        )
    }
}

impl SieveConfig {
    /// Load from a YAML, TOML or JSON file. `SIEVE__ENGINE__CHUNK_ROWS` style
    /// environment variables override file values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("SIEVE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: SieveConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.chunk_rows == 0 {
            anyhow::bail!("engine.chunk_rows must be greater than zero");
        }
        if self.engine.max_concurrent_jobs == 0 {
            anyhow::bail!("engine.max_concurrent_jobs must be greater than zero");
        }
        if self.engine.max_queued_jobs == 0 {
            anyhow::bail!("engine.max_queued_jobs must be greater than zero");
        }
        if self.engine.max_rule_depth == 0 {
            anyhow::bail!("engine.max_rule_depth must be greater than zero");
        }
        if self.preview.max_rows == 0 {
            anyhow::bail!("preview.max_rows must be greater than zero");
        }
        if self.coercion.date_formats.is_empty() {
            anyhow::bail!("coercion.date_formats must list at least one format");
        }

        let mut ids = HashSet::new();
        for dataset in &self.datasets {
            if !ids.insert(&dataset.id) {
                anyhow::bail!("Duplicate dataset id: {}", dataset.id);
            }
            if dataset.columns.is_empty() {
                anyhow::bail!("Dataset '{}' declares no columns", dataset.id);
            }
            dataset.to_schema()?;
        }
        Ok(())
    }
}
