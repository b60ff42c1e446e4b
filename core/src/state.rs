use crate::job::{Job, JobId};
use anyhow::Result;
use async_trait::async_trait;
use sled::Db;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence for job records. Only the job state machine writes to it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store a new record. Returns `false` without writing if the id exists.
    async fn insert(&self, job: &Job) -> Result<bool>;
    async fn get(&self, id: &JobId) -> Result<Option<Job>>;
    /// Overwrite an existing record.
    async fn put(&self, job: &Job) -> Result<()>;
    async fn list(&self) -> Result<Vec<Job>>;
}

pub struct SledJobStore {
    db: Db,
}

impl SledJobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn key(id: &JobId) -> String {
        format!("job:{}", id)
    }
}

#[async_trait]
impl JobStore for SledJobStore {
    async fn insert(&self, job: &Job) -> Result<bool> {
        let bytes = serde_json::to_vec(job)?;
        let swapped = self
            .db
            .compare_and_swap(Self::key(&job.id), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Ok(false);
        }
        self.db.flush_async().await?;
        Ok(true)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        match self.db.get(Self::key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec(job)?;
        self.db.insert(Self::key(&job.id), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in self.db.scan_prefix("job:") {
            let (_, bytes) = entry?;
            jobs.push(serde_json::from_slice::<Job>(&bytes)?);
        }
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[derive(Default, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Ok(false);
        }
        jobs.insert(job.id, job.clone());
        Ok(true)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn put(&self, job: &Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}
