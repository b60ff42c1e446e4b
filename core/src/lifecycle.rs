//! Job lifecycle: submission, admission to the worker pool, state transitions,
//! cancellation and polling.
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!                    ├──▶ failed
//!                    └──▶ cancelled
//! ```
//!
//! Every status change goes through [`transition`], which refuses any edge
//! not drawn above. A cancellation request only raises the job's
//! [`CancelFlag`]; the executor observes it at the next chunk boundary and the
//! worker records the outcome.

use crate::compiler::RuleCompiler;
use crate::error::{JobError, ValidationError};
use crate::executor::{CancelFlag, StreamOutcome, StreamingExecutor};
use crate::job::{Job, JobId, JobStats, JobStatus, JobStatusView};
use crate::job_queue::{JobQueue, JobRunner, JobTask};
use crate::metrics::METRICS;
use crate::predicate::CompiledPredicate;
use crate::rule::RuleTree;
use crate::schema::{DatasetRegistry, DatasetSchema};
use crate::state::JobStore;
use crate::storage::OutputSink;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub max_concurrent_jobs: usize,
    pub max_queued_jobs: usize,
    pub poll_interval: Duration,
}

impl LifecycleOptions {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs,
            max_queued_jobs: 64,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_queued_jobs(mut self, max_queued_jobs: usize) -> Self {
        self.max_queued_jobs = max_queued_jobs;
        self
    }
}

/// Cancellation flags of jobs that are queued or running.
type ActiveJobs = Arc<Mutex<HashMap<JobId, CancelFlag>>>;

pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn DatasetRegistry>,
    compiler: RuleCompiler,
    queue: JobQueue,
    active: ActiveJobs,
    poll_interval: Duration,
    worker: JoinHandle<()>,
}

impl JobStateMachine {
    /// Spawn the worker pool and return a handle for submitting jobs. Must be
    /// called inside a Tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn DatasetRegistry>,
        compiler: RuleCompiler,
        executor: StreamingExecutor,
        sink: Arc<dyn OutputSink>,
        options: LifecycleOptions,
    ) -> Self {
        let active: ActiveJobs = Arc::default();
        let (queue, worker) = JobQueue::new(options.max_queued_jobs);
        let runner = Arc::new(ExecutionRunner {
            store: Arc::clone(&store),
            executor,
            sink,
            active: Arc::clone(&active),
        });
        let worker = tokio::spawn(
            worker
                .with_concurrency(options.max_concurrent_jobs)
                .run(runner),
        );

        Self {
            store,
            registry,
            compiler,
            queue,
            active,
            poll_interval: options.poll_interval,
            worker,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn submit(&self, dataset_id: &str, rules: RuleTree) -> Result<JobId, JobError> {
        self.submit_with_id(JobId::new(), dataset_id, rules).await
    }

    /// Validate, persist as `pending` and queue. Nothing is persisted if the
    /// rules do not compile.
    pub async fn submit_with_id(
        &self,
        id: JobId,
        dataset_id: &str,
        rules: RuleTree,
    ) -> Result<JobId, JobError> {
        if let Some(existing) = self.store.get(&id).await? {
            return Err(duplicate(&existing));
        }
        if self.active.lock().await.contains_key(&id) {
            return Err(JobError::AlreadyActive(id));
        }

        let schema = self
            .registry
            .schema(dataset_id)
            .await?
            .ok_or_else(|| JobError::DatasetNotFound(dataset_id.to_string()))?;

        let predicate = match self.check(&rules, &schema) {
            Ok(predicate) => predicate,
            Err(e) => {
                METRICS.jobs_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %id, dataset_id, error = %e, "Rejected job submission");
                return Err(e);
            }
        };

        let job = Job::new(id, dataset_id, rules);
        if !self.store.insert(&job).await? {
            let existing = self.store.get(&id).await?.ok_or(JobError::NotFound(id))?;
            return Err(duplicate(&existing));
        }

        let cancel = CancelFlag::new();
        self.active.lock().await.insert(id, cancel.clone());
        let task = JobTask {
            job_id: id,
            predicate: Arc::new(predicate),
            schema: Arc::new(schema),
            cancel,
        };
        if let Err(e) = self.queue.enqueue(task).await {
            self.active.lock().await.remove(&id);
            return Err(e);
        }

        METRICS.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        info!(job_id = %id, dataset_id, "Job submitted");
        Ok(id)
    }

    fn check(
        &self,
        rules: &RuleTree,
        schema: &DatasetSchema,
    ) -> Result<CompiledPredicate, JobError> {
        let predicate = self.compiler.compile(rules, schema)?;
        if predicate.selects_nothing() {
            return Err(ValidationError::EmptyRuleTree.into());
        }
        Ok(predicate)
    }

    pub async fn status(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        let job = self.store.get(id).await?.ok_or(JobError::NotFound(*id))?;
        Ok(job.view(self.poll_interval.as_millis() as u64))
    }

    /// Request cancellation. Takes effect at the next chunk boundary; a job
    /// that is already terminal is left as is.
    pub async fn cancel(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        let view = self.status(id).await?;
        if let Some(flag) = self.active.lock().await.get(id) {
            flag.cancel();
            info!(job_id = %id, status = %view.status, "Cancellation requested");
        }
        Ok(view)
    }

    /// Poll until the job reaches a terminal state.
    pub async fn wait(&self, id: &JobId) -> Result<JobStatusView, JobError> {
        loop {
            let view = self.status(id).await?;
            match view.poll_after_ms {
                Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                None => return Ok(view),
            }
        }
    }

    /// Stop accepting jobs and wait for queued and running ones to finish.
    pub async fn shutdown(self) {
        drop(self.queue);
        if let Err(e) = self.worker.await {
            error!(error = %e, "Job worker ended abnormally");
        }
    }
}

fn duplicate(existing: &Job) -> JobError {
    if existing.status.is_terminal() {
        JobError::AlreadyExists(existing.id)
    } else {
        JobError::AlreadyActive(existing.id)
    }
}

/// Apply a status change to the stored record. The only place job status is
/// written after submission.
pub async fn transition(
    store: &dyn JobStore,
    id: &JobId,
    to: JobStatus,
    update: impl FnOnce(&mut Job) + Send,
) -> Result<Job, JobError> {
    let mut job = store.get(id).await?.ok_or(JobError::NotFound(*id))?;
    let from = job.status;
    if !from.can_transition_to(to) {
        return Err(JobError::InvalidTransition { id: *id, from, to });
    }

    job.status = to;
    update(&mut job);
    job.updated_at = Utc::now();
    store.put(&job).await?;

    info!(job_id = %id, from = %from, to = %to, "Job transition");
    Ok(job)
}

struct ExecutionRunner {
    store: Arc<dyn JobStore>,
    executor: StreamingExecutor,
    sink: Arc<dyn OutputSink>,
    active: ActiveJobs,
}

impl ExecutionRunner {
    async fn drive(&self, task: JobTask) -> Result<Job, JobError> {
        let id = task.job_id;
        transition(self.store.as_ref(), &id, JobStatus::Running, |_| {}).await?;

        let outcome = self
            .executor
            .execute(
                id,
                task.predicate,
                task.schema,
                Arc::clone(&self.sink),
                task.cancel,
            )
            .await;

        match outcome {
            Ok(StreamOutcome::Completed(report)) => {
                let stats = JobStats {
                    rows_scanned: report.rows_scanned,
                    rows_written: report.rows_written,
                    rows_filtered: report.rows_filtered(),
                };
                let output_ref = report.output_ref.clone();
                let recorded = transition(self.store.as_ref(), &id, JobStatus::Completed, move |job| {
                    job.output_ref = Some(report.output_ref);
                    job.stats = Some(stats);
                })
                .await;

                match &recorded {
                    Ok(_) => {
                        METRICS.jobs_completed.fetch_add(1, Ordering::Relaxed);
                        info!(
                            job_id = %id,
                            rows_scanned = stats.rows_scanned,
                            rows_written = stats.rows_written,
                            output = %output_ref,
                            "Job completed"
                        );
                    }
                    // No record points at the output, so it must not outlive the job.
                    Err(_) => {
                        if let Err(e) = self.sink.discard(&output_ref) {
                            warn!(job_id = %id, output = %output_ref, error = %e, "Could not discard output");
                        }
                    }
                }
                recorded
            }
            Ok(StreamOutcome::Cancelled { chunks_processed }) => {
                METRICS.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
                info!(job_id = %id, chunks_processed, "Job cancelled");
                transition(self.store.as_ref(), &id, JobStatus::Cancelled, |_| {}).await
            }
            Err(e) => {
                METRICS.jobs_failed.fetch_add(1, Ordering::Relaxed);
                error!(job_id = %id, error = %e, "Job failed");
                let message = e.to_string();
                transition(self.store.as_ref(), &id, JobStatus::Failed, move |job| {
                    job.error_message = Some(message);
                })
                .await
            }
        }
    }

    /// Best effort to leave the job terminal after its outcome could not be
    /// stored. A pending job passes through `running` first.
    async fn record_failure(&self, id: &JobId, message: String) {
        let store = self.store.as_ref();
        let status = match store.get(id).await {
            Ok(Some(job)) => job.status,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %id, error = %e, "Job left without a terminal state");
                return;
            }
        };
        if status.is_terminal() {
            return;
        }
        if status == JobStatus::Pending {
            if let Err(e) = transition(store, id, JobStatus::Running, |_| {}).await {
                error!(job_id = %id, error = %e, "Job left without a terminal state");
                return;
            }
        }

        let recorded = transition(store, id, JobStatus::Failed, move |job| {
            job.error_message = Some(message);
        })
        .await;
        match recorded {
            Ok(_) => warn!(job_id = %id, "Job marked failed after its outcome was lost"),
            Err(e) => error!(job_id = %id, error = %e, "Job left without a terminal state"),
        }
    }
}

#[async_trait]
impl JobRunner for ExecutionRunner {
    async fn run(&self, task: JobTask) {
        let id = task.job_id;
        if let Err(e) = self.drive(task).await {
            error!(job_id = %id, error = %e, "Could not record job outcome");
            self.record_failure(&id, format!("could not record job outcome: {e}"))
                .await;
        }
        self.active.lock().await.remove(&id);
    }
}
