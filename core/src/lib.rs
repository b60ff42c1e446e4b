//! # Sieve - Rule Compilation & Streaming Execution
//!
//! Sieve turns declarative, nested row-filtering rules into schema-typed
//! predicates and applies them in two places: an instant preview over a small
//! sample, and a chunked streaming pass over the full dataset that writes the
//! matching rows atomically.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sieve_core::{config::SieveConfig, rule::RuleTree, CleaningEngine};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = SieveConfig::from_file("sieve.yaml")?;
//! let engine = CleaningEngine::from_config(config).await?;
//!
//! let rules = RuleTree::from_json(
//!     r#"{"combinator": "and", "rules": [
//!         {"field": "age", "operator": "greater_than_or_equal", "value": 18}
//!     ]}"#,
//! )?;
//! let preview = engine.preview("customers", &rules).await?;
//! println!("{} of {} sample rows match", preview.matches, preview.total);
//!
//! let job_id = engine.submit("customers", rules).await?;
//! let done = engine.wait(&job_id).await?;
//! println!("{} -> {:?}", done.status, done.output_ref);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **No dynamic code**: rules compile to a closed set of typed comparisons
//! - **One row decision**: preview and streaming share a single evaluator
//! - **Bounded memory**: datasets are read in fixed-size Arrow chunks
//! - **Atomic output**: results appear only after a successful commit

pub mod coercion;
pub mod compiler;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod job_queue;
pub mod lifecycle;
pub mod metrics;
pub mod predicate;
pub mod preview;
pub mod rule;
pub mod schema;
pub mod state;
pub mod storage;

use crate::coercion::TypeCoercionResolver;
use crate::compiler::RuleCompiler;
use crate::config::SieveConfig;
use crate::error::JobError;
use crate::executor::StreamingExecutor;
use crate::job::{JobId, JobStatusView};
use crate::lifecycle::{JobStateMachine, LifecycleOptions};
use crate::predicate::CompiledPredicate;
use crate::preview::{PreviewEvaluator, PreviewResult, PreviewSample};
use crate::rule::RuleTree;
use crate::schema::{DatasetRegistry, DatasetSchema, InMemoryDatasetRegistry};
use crate::state::{JobStore, MemoryJobStore, SledJobStore};
use crate::storage::{CsvDatasetSource, LocalOutputSink};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Wires registry, compiler, preview and the job state machine together.
pub struct CleaningEngine {
    registry: Arc<dyn DatasetRegistry>,
    compiler: RuleCompiler,
    preview: PreviewEvaluator,
    source: Arc<CsvDatasetSource>,
    jobs: JobStateMachine,
}

impl CleaningEngine {
    /// Build an engine from configuration. Datasets listed in the config are
    /// registered; jobs persist to sled when `persistence_path` is set.
    pub async fn from_config(config: SieveConfig) -> Result<Self> {
        config.validate()?;

        let registry = InMemoryDatasetRegistry::new();
        for dataset in &config.datasets {
            registry.register(dataset.to_schema()?).await;
        }

        let store: Arc<dyn JobStore> = match &config.engine.persistence_path {
            Some(path) => Arc::new(SledJobStore::new(path)?),
            None => Arc::new(MemoryJobStore::new()),
        };

        let resolver = Arc::new(TypeCoercionResolver::new(config.coercion.date_formats.clone()));
        let compiler = RuleCompiler::new(resolver, config.engine.max_rule_depth);
        let source = Arc::new(CsvDatasetSource::new());
        let executor = StreamingExecutor::new(source.clone(), config.engine.chunk_rows)
            .with_invalid_values(config.engine.malformed_rows.into());
        let sink = Arc::new(LocalOutputSink::new(
            config.engine.output_dir.clone(),
            config.engine.output_format,
        ));
        let options = LifecycleOptions::new(config.engine.max_concurrent_jobs)
            .with_max_queued_jobs(config.engine.max_queued_jobs)
            .with_poll_interval(Duration::from_millis(config.engine.poll_interval_ms));

        info!(
            datasets = config.datasets.len(),
            chunk_rows = config.engine.chunk_rows,
            workers = config.engine.max_concurrent_jobs,
            persistent = config.engine.persistence_path.is_some(),
            "Engine initialised"
        );

        let registry: Arc<dyn DatasetRegistry> = Arc::new(registry);
        let jobs = JobStateMachine::start(
            store,
            Arc::clone(&registry),
            compiler.clone(),
            executor,
            sink,
            options,
        );

        Ok(Self {
            registry,
            compiler,
            preview: PreviewEvaluator::new(config.preview.max_rows),
            source,
            jobs,
        })
    }

    pub fn jobs(&self) -> &JobStateMachine {
        &self.jobs
    }

    async fn schema(&self, dataset_id: &str) -> Result<DatasetSchema, JobError> {
        self.registry
            .schema(dataset_id)
            .await?
            .ok_or_else(|| JobError::DatasetNotFound(dataset_id.to_string()))
    }

    /// Validate rules against a registered dataset without reading it.
    pub async fn compile(
        &self,
        dataset_id: &str,
        rules: &RuleTree,
    ) -> Result<CompiledPredicate, JobError> {
        let schema = self.schema(dataset_id).await?;
        Ok(self.compiler.compile(rules, &schema)?)
    }

    /// Evaluate rules against the first rows of the dataset.
    pub async fn preview(&self, dataset_id: &str, rules: &RuleTree) -> Result<PreviewResult, JobError> {
        let schema = self.schema(dataset_id).await?;
        let predicate = self.compiler.compile(rules, &schema)?;

        let source = Arc::clone(&self.source);
        let limit = self.preview.max_rows();
        let sample = tokio::task::spawn_blocking(move || source.sample(&schema, limit))
            .await
            .map_err(|e| JobError::Sample(error::ExecutionError::Aborted(e.to_string())))?
            .map_err(JobError::Sample)?;

        Ok(self.preview.evaluate(&predicate, &sample))
    }

    /// Evaluate rules against a sample the caller already holds.
    pub async fn preview_sample(
        &self,
        dataset_id: &str,
        rules: &RuleTree,
        sample: &PreviewSample,
    ) -> Result<PreviewResult, JobError> {
        let predicate = self.compile(dataset_id, rules).await?;
        Ok(self.preview.evaluate(&predicate, sample))
    }

    pub async fn submit(&self, dataset_id: &str, rules: RuleTree) -> Result<JobId, JobError> {
        self.jobs.submit(dataset_id, rules).await
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        self.jobs.status(id).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        self.jobs.cancel(id).await
    }

    pub async fn wait(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        self.jobs.wait(id).await
    }

    pub async fn shutdown(self) {
        self.jobs.shutdown().await;
    }
}
