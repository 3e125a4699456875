//! Job persistence and the idempotency index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use mesh_primitives::{AgentId, Job, JobId, JobStatus};

use crate::error::JobsResult;

/// Storage backend for job records.
///
/// `insert_or_fetch` is the idempotency point: for a keyed submission it
/// must atomically either insert the new record or return the existing
/// job for the same key, so two concurrent submissions can never both
/// create a job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts the job, or returns the existing record when its idempotency
    /// key is already bound to a live job.
    async fn insert_or_fetch(&self, job: Job) -> JobsResult<InsertOutcome>;

    /// Returns the record for a job, if any.
    async fn get(&self, job_id: JobId) -> JobsResult<Option<Job>>;

    /// Replaces an existing record.
    async fn update(&self, job: Job) -> JobsResult<()>;

    /// Lists jobs with the given status.
    async fn list_by_status(&self, status: JobStatus) -> JobsResult<Vec<Job>>;

    /// Lists jobs currently assigned to an agent.
    async fn list_by_agent(&self, agent_id: AgentId) -> JobsResult<Vec<Job>>;

    /// Lists jobs created inside the given time range.
    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> JobsResult<Vec<Job>>;
}

/// Outcome of [`JobStore::insert_or_fetch`].
#[derive(Clone, Debug)]
pub enum InsertOutcome {
    /// The record was inserted.
    Inserted,
    /// An existing job holds the idempotency key.
    Existing(Job),
}

/// In-memory job store for development and tests.
///
/// Jobs live in one concurrent map; the idempotency index maps keys to the
/// job currently holding them. Both maps are `DashMap`s so hot-path reads
/// do not serialize.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    index: DashMap<String, JobId>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert_or_fetch(&self, job: Job) -> JobsResult<InsertOutcome> {
        if let Some(key) = job.idempotency_key.clone() {
            match self.index.entry(key) {
                Entry::Occupied(occupied) => {
                    let existing_id = *occupied.get();
                    let existing = self
                        .jobs
                        .get(&existing_id)
                        .map(|j| j.clone())
                        .ok_or_else(|| {
                            crate::JobError::store(format!(
                                "idempotency index references missing job {existing_id}"
                            ))
                        })?;
                    return Ok(InsertOutcome::Existing(existing));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(job.id);
                }
            }
        }
        self.jobs.insert(job.id, job);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, job_id: JobId) -> JobsResult<Option<Job>> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn update(&self, job: Job) -> JobsResult<()> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn list_by_status(&self, status: JobStatus) -> JobsResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.clone())
            .collect())
    }

    async fn list_by_agent(&self, agent_id: AgentId) -> JobsResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.assigned_agent_id == Some(agent_id))
            .map(|j| j.clone())
            .collect())
    }

    async fn list_created_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> JobsResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.created_at >= from && j.created_at <= to)
            .map(|j| j.clone())
            .collect())
    }

}
