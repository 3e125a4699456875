//! Dead-letter sink for jobs that exhausted their retry budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use mesh_primitives::Job;

use crate::error::JobsResult;

/// A job recorded to dead-letter with its final error.
#[derive(Clone, Debug)]
pub struct DeadLetterEntry {
    /// The job record at the moment retries were exhausted.
    pub job: Job,
    /// Why the job ended up here.
    pub reason: String,
    /// Time of recording.
    pub recorded_at: DateTime<Utc>,
}

/// Sink receiving exhausted jobs.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records a job whose retries are exhausted.
    async fn record(&self, job: Job, reason: String) -> JobsResult<()>;

    /// Lists all recorded entries.
    async fn all(&self) -> JobsResult<Vec<DeadLetterEntry>>;
}

/// In-memory dead-letter sink for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetter {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetter {
    async fn record(&self, job: Job, reason: String) -> JobsResult<()> {
        self.entries.lock().await.push(DeadLetterEntry {
            job,
            reason,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn all(&self) -> JobsResult<Vec<DeadLetterEntry>> {
        Ok(self.entries.lock().await.clone())
    }
}
