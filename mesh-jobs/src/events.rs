//! The append-only job event log.
//!
//! Every state transition appends exactly one event. The log is the
//! serialization point for observers: events for one job are observed in
//! transition order, and replaying the log reconstructs in-memory state
//! after a restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use mesh_primitives::{AgentId, JobId};

use crate::error::JobsResult;

/// What happened to a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobEventKind {
    /// The job was created at `Pending`.
    Submitted,
    /// The dispatcher handed the job to an agent.
    Assigned {
        /// Receiving agent.
        agent_id: AgentId,
    },
    /// The agent acknowledged and began executing.
    Started,
    /// The assignment round ended without completion.
    Rejected {
        /// Why the round ended (NACK, ack timeout, disconnect).
        reason: String,
    },
    /// A caller cancelled the job.
    Cancelled {
        /// Caller-supplied reason.
        reason: String,
    },
    /// The job completed successfully.
    Completed,
    /// The job failed.
    Failed {
        /// Error message from the agent.
        error: String,
    },
    /// The execution or queue timer fired.
    TimedOut,
    /// A retry was scheduled after a failure or timeout.
    RetryScheduled {
        /// Delay before the job becomes dispatchable again.
        delay: Duration,
    },
    /// The retry delay elapsed and the job returned to `Pending`.
    Retried,
    /// Retries were exhausted and the job was recorded to dead-letter.
    DeadLettered,
}

/// One record in the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Global position; strictly increasing across all jobs.
    pub position: u64,
    /// Job the event belongs to.
    pub job_id: JobId,
    /// Per-job sequence; strictly increasing within one job.
    pub sequence: u64,
    /// What happened.
    pub kind: JobEventKind,
    /// Time the event was appended.
    pub at: DateTime<Utc>,
}

/// Append-only event storage.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event, returning its global position.
    async fn append(&self, job_id: JobId, kind: JobEventKind) -> JobsResult<u64>;

    /// Returns all events for one job in sequence order.
    async fn for_job(&self, job_id: JobId) -> JobsResult<Vec<JobEvent>>;

    /// Returns all events from a position onward, in position order.
    async fn from_position(&self, position: u64) -> JobsResult<Vec<JobEvent>>;
}

/// In-memory event log for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    inner: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<JobEvent>,
    next_position: u64,
    sequences: HashMap<JobId, u64>,
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, job_id: JobId, kind: JobEventKind) -> JobsResult<u64> {
        let mut state = self.inner.lock().await;
        let position = state.next_position;
        state.next_position += 1;
        let sequence = state.sequences.entry(job_id).or_insert(0);
        let event = JobEvent {
            position,
            job_id,
            sequence: *sequence,
            kind,
            at: Utc::now(),
        };
        *sequence += 1;
        state.events.push(event);
        Ok(position)
    }

    async fn for_job(&self, job_id: JobId) -> JobsResult<Vec<JobEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn from_position(&self, position: u64) -> JobsResult<Vec<JobEvent>> {
        Ok(self
            .inner
            .lock()
            .await
            .events
            .iter()
            .filter(|e| e.position >= position)
            .cloned()
            .collect())
    }
}
