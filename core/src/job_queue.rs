use crate::error::JobError;
use crate::executor::CancelFlag;
use crate::job::JobId;
use crate::predicate::CompiledPredicate;
use crate::schema::DatasetSchema;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Everything a worker needs to execute one submitted job.
pub struct JobTask {
    pub job_id: JobId,
    pub predicate: Arc<CompiledPredicate>,
    pub schema: Arc<DatasetSchema>,
    pub cancel: CancelFlag,
}

/// Runs a dequeued job to a terminal state.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, task: JobTask);
}

/// Admission queue for submitted jobs. Jobs wait here, in `pending`, until a
/// worker is free.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<JobTask>, // Bounded channel for backpressure
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, JobQueueWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = JobQueueWorker {
            receiver: rx,
            concurrency: 1,
        };
        (Self { sender: tx }, worker)
    }

    /// Waits while the queue is full.
    pub async fn enqueue(&self, task: JobTask) -> Result<(), JobError> {
        let job_id = task.job_id;
        self.sender
            .send(task)
            .await
            .map_err(|_| JobError::QueueClosed)?;
        debug!(job_id = %job_id, "Job queued");
        Ok(())
    }
}

/// Pulls jobs off the queue with a fixed number of concurrent executions.
pub struct JobQueueWorker {
    receiver: mpsc::Receiver<JobTask>,
    concurrency: usize,
}

impl JobQueueWorker {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Returns once every `JobQueue` handle is dropped and in-flight jobs finish.
    pub async fn run(self, runner: Arc<dyn JobRunner>) {
        let concurrency = self.concurrency.max(1);
        info!(concurrency, "Job queue worker started");

        // Workers share the receiver; each takes the next job when idle.
        let shared_rx = Arc::new(Mutex::new(self.receiver));
        let mut handles = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let rx = Arc::clone(&shared_rx);
            let runner = Arc::clone(&runner);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(task) = task else {
                        break; // Channel closed
                    };
                    debug!(worker_id, job_id = %task.job_id, "Worker picked up job");
                    runner.run(task).await;
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Job queue worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::PredicateNode;
    use crate::schema::{Column, ColumnType, StorageRef};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _task: JobTask) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task() -> JobTask {
        let schema = DatasetSchema::try_new(
            "d",
            vec![Column::new("a", ColumnType::Text)],
            None,
            StorageRef("d.csv".into()),
        )
        .unwrap();
        JobTask {
            job_id: JobId::new(),
            predicate: Arc::new(crate::predicate::CompiledPredicate::new(
                PredicateNode::Any(Vec::new()),
                Arc::new(crate::coercion::TypeCoercionResolver::default()),
                0,
            )),
            schema: Arc::new(schema),
            cancel: CancelFlag::new(),
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let (queue, worker) = JobQueue::new(16);
        let runner = Arc::new(CountingRunner::default());
        let handle = tokio::spawn(worker.with_concurrency(2).run(runner.clone()));

        for _ in 0..6 {
            queue.enqueue(task()).await.unwrap();
        }
        drop(queue);
        handle.await.unwrap();

        assert_eq!(runner.finished.load(Ordering::SeqCst), 6);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_worker_gone() {
        let (queue, worker) = JobQueue::new(1);
        drop(worker);
        assert!(matches!(queue.enqueue(task()).await, Err(JobError::QueueClosed)));
    }
}
