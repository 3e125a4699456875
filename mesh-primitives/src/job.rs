//! Job records and submission types.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::report::JobProgress;
use crate::{AgentId, CapabilitySet, JobId};

/// Lifecycle status of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for the dispatcher to select an agent.
    Pending,
    /// Sent to an agent, awaiting acknowledgement.
    Assigned,
    /// Acknowledged and executing on an agent.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Execution failed; may be retried until attempts are exhausted.
    Failed,
    /// Cancelled by a caller. Terminal.
    Cancelled,
    /// A timeout fired; may be retried until attempts are exhausted.
    TimedOut,
}

impl JobStatus {
    /// Returns `true` when the status can never be left regardless of retries.
    #[must_use]
    pub const fn is_always_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` when the job occupies an agent slot.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

/// A client request to run a command on the mesh.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    /// Command name understood by the executing agent.
    pub command: String,
    /// Opaque parameter bytes passed through to the agent.
    #[serde(default)]
    pub parameters: Bytes,
    /// Client-supplied key collapsing duplicate submissions to one job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Scheduling priority; higher values dispatch first.
    #[serde(default)]
    pub priority: i32,
    /// Execution timeout; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Retry budget; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Pins the job to one agent instead of capability matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<AgentId>,
    /// Capability identifiers the executing agent must advertise.
    #[serde(default, skip_serializing_if = "CapabilitySet::is_empty")]
    pub required_capabilities: CapabilitySet,
    /// Caller correlation identifier propagated into events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Free-form metadata stored with the job.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl JobRequest {
    /// Creates a request for the given command with default settings.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameters: Bytes::new(),
            idempotency_key: None,
            priority: 0,
            timeout: None,
            max_retries: None,
            target_agent_id: None,
            required_capabilities: CapabilitySet::new(),
            correlation_id: None,
            metadata: HashMap::new(),
        }
    }
}

/// Authoritative record of a job owned by the job store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Idempotency key the job was submitted under, if any.
    pub idempotency_key: Option<String>,
    /// Command name.
    pub command: String,
    /// Opaque parameter bytes.
    pub parameters: Bytes,
    /// Scheduling priority; higher dispatches first.
    pub priority: i32,
    /// Execution timeout applied on transition to `Running`.
    pub timeout: Duration,
    /// Retry budget; `attempt_count` may reach `max_retries + 1`.
    pub max_retries: u32,
    /// Pinned target agent, if any.
    pub target_agent_id: Option<AgentId>,
    /// Capabilities the executing agent must advertise.
    pub required_capabilities: CapabilitySet,
    /// Caller correlation identifier.
    pub correlation_id: Option<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, String>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Agent currently holding the job; set iff status is in flight.
    pub assigned_agent_id: Option<AgentId>,
    /// Number of execution attempts started so far.
    pub attempt_count: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent assignment.
    pub assigned_at: Option<DateTime<Utc>>,
    /// Time the most recent attempt was acknowledged.
    pub started_at: Option<DateTime<Utc>>,
    /// Time a terminal status was recorded.
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent progress report, if any.
    pub last_progress: Option<JobProgress>,
    /// Result payload recorded on completion.
    pub result: Option<Bytes>,
    /// Error message recorded on failure or timeout.
    pub error: Option<String>,
    /// Machine-readable error code recorded on failure or timeout.
    pub error_code: Option<String>,
}

impl Job {
    /// Returns `true` when the job can never transition again.
    ///
    /// `Failed` and `TimedOut` are terminal only once the retry budget is
    /// exhausted; `Completed` and `Cancelled` always are.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Failed | JobStatus::TimedOut => self.attempt_count > self.max_retries,
            JobStatus::Pending | JobStatus::Assigned | JobStatus::Running => false,
        }
    }

    /// Returns `true` when a further retry is permitted.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        matches!(self.status, JobStatus::Failed | JobStatus::TimedOut)
            && self.attempt_count <= self.max_retries
    }
}

/// Outcome of a job submission.
///
/// Submissions always succeed immediately; backpressure and eligibility are
/// reflected through the job's status, never surfaced to the submitter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitReceipt {
    /// A new job was created.
    Created(JobId),
    /// An existing job with the same idempotency key was returned.
    Existing(JobId),
}

impl SubmitReceipt {
    /// Returns the job identifier regardless of variant.
    #[must_use]
    pub const fn job_id(self) -> JobId {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }

    /// Returns `true` when the submission created a new job.
    #[must_use]
    pub const fn is_created(self) -> bool {
        matches!(self, Self::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, attempts: u32, max_retries: u32) -> Job {
        Job {
            id: JobId::random(),
            idempotency_key: None,
            command: "echo".into(),
            parameters: Bytes::new(),
            priority: 0,
            timeout: Duration::from_secs(60),
            max_retries,
            target_agent_id: None,
            required_capabilities: CapabilitySet::new(),
            correlation_id: None,
            metadata: HashMap::new(),
            status,
            assigned_agent_id: None,
            attempt_count: attempts,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            last_progress: None,
            result: None,
            error: None,
            error_code: None,
        }
    }

    #[test]
    fn failed_is_terminal_only_when_exhausted() {
        assert!(!job(JobStatus::Failed, 1, 2).is_terminal());
        assert!(job(JobStatus::Failed, 3, 2).is_terminal());
        assert!(job(JobStatus::Cancelled, 0, 2).is_terminal());
    }

    #[test]
    fn retry_respects_budget() {
        assert!(job(JobStatus::TimedOut, 2, 2).can_retry());
        assert!(!job(JobStatus::TimedOut, 3, 2).can_retry());
        assert!(!job(JobStatus::Running, 0, 2).can_retry());
    }

    #[test]
    fn receipt_carries_id() {
        let id = JobId::random();
        assert_eq!(SubmitReceipt::Created(id).job_id(), id);
        assert!(!SubmitReceipt::Existing(id).is_created());
    }
}
