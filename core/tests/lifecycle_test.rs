use async_trait::async_trait;
use serde_json::json;
use sieve_core::compiler::RuleCompiler;
use sieve_core::error::{CompileError, ExecutionError, JobError, ValidationError};
use sieve_core::executor::StreamingExecutor;
use sieve_core::job::{Job, JobId, JobStatus, JobStatusView};
use sieve_core::lifecycle::{JobStateMachine, LifecycleOptions};
use sieve_core::rule::RuleTree;
use sieve_core::schema::{Column, ColumnType, DatasetSchema, InMemoryDatasetRegistry, StorageRef};
use sieve_core::state::{JobStore, MemoryJobStore};
use sieve_core::storage::{ChunkReader, CsvDatasetSource, DatasetSource, LocalOutputSink, OutputFormat};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const PEOPLE: &str = "name,age,status,email\n\
ana,17,active,ana@example.com\n\
ben,25,active,ben@corp.io\n\
cai,30,inactive,cai@example.com\n\
dee,,active,dee@example.com\n\
eli,52,Active,eli@example.com\n";

fn adults_active() -> RuleTree {
    RuleTree::from_value(json!({"combinator": "and", "rules": [
        {"field": "age", "operator": "greater_than_or_equal", "value": 18},
        {"field": "status", "operator": "equals", "value": "active"}
    ]}))
    .unwrap()
}

/// Holds every chunk until the test drops the paired sender.
struct GatedSource {
    inner: CsvDatasetSource,
    gate: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl GatedSource {
    fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                inner: CsvDatasetSource::new(),
                gate: Arc::new(Mutex::new(rx)),
            },
            tx,
        )
    }
}

impl DatasetSource for GatedSource {
    fn open(&self, schema: &DatasetSchema, chunk_rows: usize) -> Result<ChunkReader, ExecutionError> {
        let gate = Arc::clone(&self.gate);
        let reader = self.inner.open(schema, chunk_rows)?;
        Ok(Box::new(reader.map(move |batch| {
            let _ = gate.lock().unwrap().recv();
            batch
        })))
    }
}

/// Yields one good chunk, then fails as if the disk went away.
struct FlakySource(CsvDatasetSource);

impl DatasetSource for FlakySource {
    fn open(&self, schema: &DatasetSchema, chunk_rows: usize) -> Result<ChunkReader, ExecutionError> {
        let reader = self.0.open(schema, chunk_rows)?;
        Ok(Box::new(reader.take(1).chain(std::iter::once(Err(ExecutionError::Io(
            std::io::Error::new(std::io::ErrorKind::Other, "storage detached"),
        ))))))
    }
}

struct Harness {
    _dir: TempDir,
    out: PathBuf,
    store: Arc<MemoryJobStore>,
    machine: JobStateMachine,
}

impl Harness {
    async fn new(source: Arc<dyn DatasetSource>, workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("people.csv");
        std::fs::write(&data, PEOPLE).unwrap();
        let out = dir.path().join("out");

        let registry = InMemoryDatasetRegistry::new();
        registry.register(people_schema(&data)).await;
        let store = Arc::new(MemoryJobStore::new());

        let machine = JobStateMachine::start(
            store.clone(),
            Arc::new(registry),
            RuleCompiler::default(),
            StreamingExecutor::new(source, 2),
            Arc::new(LocalOutputSink::new(&out, OutputFormat::Csv)),
            LifecycleOptions::new(workers).with_poll_interval(Duration::from_millis(10)),
        );

        Self {
            _dir: dir,
            out,
            store,
            machine,
        }
    }

    fn output_entries(&self) -> usize {
        std::fs::read_dir(&self.out).map(|d| d.count()).unwrap_or(0)
    }

    async fn wait(&self, id: &JobId) -> JobStatusView {
        tokio::time::timeout(Duration::from_secs(10), self.machine.wait(id))
            .await
            .expect("job did not finish")
            .unwrap()
    }

    async fn wait_for(&self, id: &JobId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.machine.status(id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("status never reached");
    }
}

fn people_schema(path: &Path) -> DatasetSchema {
    DatasetSchema::try_new(
        "people",
        vec![
            Column::new("name", ColumnType::Text),
            Column::new("age", ColumnType::Number),
            Column::new("status", ColumnType::Text),
            Column::new("email", ColumnType::Text),
        ],
        Some(5),
        StorageRef(path.display().to_string()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_job_completes_with_output() {
    let h = Harness::new(Arc::new(CsvDatasetSource::new()), 2).await;

    let id = h.machine.submit("people", adults_active()).await.unwrap();
    let view = h.wait(&id).await;

    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.poll_after_ms, None);
    assert!(view.error_message.is_none());
    let stats = view.stats.unwrap();
    assert_eq!((stats.rows_scanned, stats.rows_written, stats.rows_filtered), (5, 2, 3));

    let output = view.output_ref.unwrap();
    assert_eq!(
        std::fs::read_to_string(&output.0).unwrap(),
        "name,age,status,email\nben,25,active,ben@corp.io\neli,52,Active,eli@example.com\n"
    );
    assert_eq!(h.output_entries(), 1);

    let record = h.store.get(&id).await.unwrap().unwrap();
    assert!(record.updated_at >= record.created_at);
}

#[tokio::test]
async fn test_jobs_wait_in_pending_when_pool_is_full() {
    let (source, release) = GatedSource::new();
    let h = Harness::new(Arc::new(source), 1).await;

    let first = h.machine.submit("people", adults_active()).await.unwrap();
    h.wait_for(&first, JobStatus::Running).await;
    let second = h.machine.submit("people", adults_active()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let view = h.machine.status(&second).await.unwrap();
    assert_eq!(view.status, JobStatus::Pending);
    assert_eq!(view.poll_after_ms, Some(10));

    drop(release);
    assert_eq!(h.wait(&first).await.status, JobStatus::Completed);
    assert_eq!(h.wait(&second).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancellation_leaves_no_output() {
    let (source, release) = GatedSource::new();
    let h = Harness::new(Arc::new(source), 1).await;

    let id = h.machine.submit("people", adults_active()).await.unwrap();
    h.wait_for(&id, JobStatus::Running).await;

    let view = h.machine.cancel(&id).await.unwrap();
    assert_eq!(view.status, JobStatus::Running);
    drop(release);

    let view = h.wait(&id).await;
    assert_eq!(view.status, JobStatus::Cancelled);
    assert!(view.output_ref.is_none());
    assert!(view.error_message.is_none());
    assert_eq!(h.output_entries(), 0);
}

#[tokio::test]
async fn test_cancel_while_pending_runs_then_cancels() {
    let (source, release) = GatedSource::new();
    let h = Harness::new(Arc::new(source), 1).await;

    let blocker = h.machine.submit("people", adults_active()).await.unwrap();
    h.wait_for(&blocker, JobStatus::Running).await;
    let queued = h.machine.submit("people", adults_active()).await.unwrap();
    assert_eq!(
        h.machine.cancel(&queued).await.unwrap().status,
        JobStatus::Pending
    );

    drop(release);
    assert_eq!(h.wait(&blocker).await.status, JobStatus::Completed);
    assert_eq!(h.wait(&queued).await.status, JobStatus::Cancelled);
    assert_eq!(h.output_entries(), 1);
}

#[tokio::test]
async fn test_io_failure_mid_stream_fails_without_artifacts() {
    let h = Harness::new(Arc::new(FlakySource(CsvDatasetSource::new())), 1).await;

    let id = h.machine.submit("people", adults_active()).await.unwrap();
    let view = h.wait(&id).await;

    assert_eq!(view.status, JobStatus::Failed);
    let message = view.error_message.unwrap();
    assert!(message.contains("storage detached"), "{message}");
    assert!(view.output_ref.is_none());
    assert_eq!(h.output_entries(), 0);
}

#[tokio::test]
async fn test_malformed_row_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let dirty = dir.path().join("dirty.csv");
    std::fs::write(&dirty, "name,age,status,email\nzed,unknown,active,z@x.io\n").unwrap();

    let registry = InMemoryDatasetRegistry::new();
    registry.register(people_schema(&dirty)).await;
    let machine = JobStateMachine::start(
        Arc::new(MemoryJobStore::new()),
        Arc::new(registry),
        RuleCompiler::default(),
        StreamingExecutor::new(Arc::new(CsvDatasetSource::new()), 10),
        Arc::new(LocalOutputSink::new(dir.path().join("out"), OutputFormat::Csv)),
        LifecycleOptions::new(1).with_poll_interval(Duration::from_millis(10)),
    );

    let id = machine.submit("people", adults_active()).await.unwrap();
    let view = machine.wait(&id).await.unwrap();
    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.error_message.unwrap().contains("'age'"));
    assert_eq!(std::fs::read_dir(dir.path().join("out")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_validation_errors_create_no_job() {
    let h = Harness::new(Arc::new(CsvDatasetSource::new()), 1).await;

    let mismatch = RuleTree::from_value(json!({"combinator": "and", "rules": [
        {"field": "email", "operator": "greater_than", "value": "x"}
    ]}))
    .unwrap();
    let err = h.machine.submit("people", mismatch).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Rejected(CompileError::Validation(
            ValidationError::OperatorNotApplicable { .. }
        ))
    ));

    let empty = RuleTree::from_value(json!({"combinator": "or", "rules": []})).unwrap();
    let err = h.machine.submit("people", empty).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Rejected(CompileError::Validation(ValidationError::EmptyRuleTree))
    ));

    let not_numeric = RuleTree::from_value(json!({"combinator": "and", "rules": [
        {"field": "age", "operator": "less_than", "value": "many"}
    ]}))
    .unwrap();
    let err = h.machine.submit("people", not_numeric).await.unwrap_err();
    assert!(matches!(err, JobError::Rejected(CompileError::Coercion(_))));

    let err = h.machine.submit("nope", adults_active()).await.unwrap_err();
    assert!(matches!(err, JobError::DatasetNotFound(_)));

    assert!(h.store.list().await.unwrap().is_empty());
    assert_eq!(h.output_entries(), 0);
}

#[tokio::test]
async fn test_job_ids_are_single_use() {
    let (source, release) = GatedSource::new();
    let h = Harness::new(Arc::new(source), 1).await;
    let id = JobId::new();

    h.machine
        .submit_with_id(id, "people", adults_active())
        .await
        .unwrap();
    let err = h
        .machine
        .submit_with_id(id, "people", adults_active())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::AlreadyActive(active) if active == id));

    drop(release);
    assert_eq!(h.wait(&id).await.status, JobStatus::Completed);

    let err = h
        .machine
        .submit_with_id(id, "people", adults_active())
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::AlreadyExists(existing) if existing == id));
}

#[tokio::test]
async fn test_terminal_jobs_ignore_cancel() {
    let h = Harness::new(Arc::new(CsvDatasetSource::new()), 1).await;
    let id = h.machine.submit("people", adults_active()).await.unwrap();
    let done = h.wait(&id).await;

    let after = h.machine.cancel(&id).await.unwrap();
    assert_eq!(after, done);
    assert!(matches!(
        h.machine.status(&JobId::new()).await,
        Err(JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let h = Harness::new(Arc::new(CsvDatasetSource::new()), 2).await;
    let ids = [
        h.machine.submit("people", adults_active()).await.unwrap(),
        h.machine.submit("people", adults_active()).await.unwrap(),
        h.machine.submit("people", adults_active()).await.unwrap(),
    ];
    let store = h.store.clone();
    h.machine.shutdown().await;

    for id in ids {
        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}

/// Refuses to store a job as completed; every other write goes through.
struct NoCompletionStore(MemoryJobStore);

#[async_trait]
impl JobStore for NoCompletionStore {
    async fn insert(&self, job: &Job) -> anyhow::Result<bool> {
        self.0.insert(job).await
    }

    async fn get(&self, id: &JobId) -> anyhow::Result<Option<Job>> {
        self.0.get(id).await
    }

    async fn put(&self, job: &Job) -> anyhow::Result<()> {
        if job.status == JobStatus::Completed {
            anyhow::bail!("store is read-only");
        }
        self.0.put(job).await
    }

    async fn list(&self) -> anyhow::Result<Vec<Job>> {
        self.0.list().await
    }
}

#[tokio::test]
async fn test_lost_completion_fails_job_and_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("people.csv");
    std::fs::write(&data, PEOPLE).unwrap();
    let out = dir.path().join("out");

    let registry = InMemoryDatasetRegistry::new();
    registry.register(people_schema(&data)).await;
    let machine = JobStateMachine::start(
        Arc::new(NoCompletionStore(MemoryJobStore::new())),
        Arc::new(registry),
        RuleCompiler::default(),
        StreamingExecutor::new(Arc::new(CsvDatasetSource::new()), 2),
        Arc::new(LocalOutputSink::new(&out, OutputFormat::Csv)),
        LifecycleOptions::new(1).with_poll_interval(Duration::from_millis(10)),
    );

    let id = machine.submit("people", adults_active()).await.unwrap();
    let view = tokio::time::timeout(Duration::from_secs(10), machine.wait(&id))
        .await
        .expect("job never reached a terminal state")
        .unwrap();

    assert_eq!(view.status, JobStatus::Failed);
    assert!(view.output_ref.is_none());
    assert!(view.error_message.unwrap().contains("read-only"));
    assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
}
