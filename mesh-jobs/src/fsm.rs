//! The job state machine.
//!
//! The transition table is the contract: every legal `(status, trigger)`
//! pair appears here, and nothing outside this module decides what a job
//! may do next. [`crate::JobService`] interprets the table, serializing
//! transitions per job and recording each one in the event log.

use mesh_primitives::{AgentId, JobResult, JobStatus};

/// Triggers that drive job status changes.
#[derive(Clone, Debug, PartialEq)]
pub enum JobTrigger {
    /// The dispatcher handed the job to an agent.
    Assign(AgentId),
    /// The agent acknowledged the assignment and began executing.
    Start,
    /// The agent refused the assignment, or its connection was lost.
    Reject {
        /// Why the assignment round ended.
        reason: String,
    },
    /// A caller cancelled the job.
    Cancel {
        /// Caller-supplied reason.
        reason: String,
    },
    /// The agent reported successful completion.
    Complete(JobResult),
    /// The agent reported a failure.
    Fail {
        /// Error message from the agent.
        error: String,
        /// Machine-readable error code.
        error_code: Option<String>,
    },
    /// The acknowledgement or execution timer fired.
    Timeout,
    /// The retry timer elapsed and the job may run again.
    Retry,
}

impl JobTrigger {
    /// Short name used in logs and events.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Assign(_) => "assign",
            Self::Start => "start",
            Self::Reject { .. } => "reject",
            Self::Cancel { .. } => "cancel",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::Timeout => "timeout",
            Self::Retry => "retry",
        }
    }
}

/// Computes the destination status for a trigger, or `None` when the
/// transition is not in the table.
///
/// `attempt_count` and `max_retries` gate the `Assign` and `Retry` rows:
/// an assignment consumes one attempt, so at most `max_retries + 1`
/// assignments can ever happen. A timeout on an `Assigned` job means the
/// acknowledgement never arrived and sends the job back to `Pending`; a
/// timeout on a `Running` job is an execution timeout and lands in
/// `TimedOut`.
#[must_use]
pub fn next_status(
    status: JobStatus,
    trigger: &JobTrigger,
    attempt_count: u32,
    max_retries: u32,
) -> Option<JobStatus> {
    use JobStatus as S;

    match (status, trigger) {
        (S::Pending, JobTrigger::Assign(_)) if attempt_count <= max_retries => Some(S::Assigned),
        (S::Pending, JobTrigger::Cancel { .. }) => Some(S::Cancelled),
        (S::Pending, JobTrigger::Timeout) => Some(S::TimedOut),

        (S::Assigned, JobTrigger::Start) => Some(S::Running),
        (S::Assigned, JobTrigger::Reject { .. } | JobTrigger::Timeout) => Some(S::Pending),
        (S::Assigned, JobTrigger::Cancel { .. }) => Some(S::Cancelled),

        (S::Running, JobTrigger::Complete(_)) => Some(S::Completed),
        (S::Running, JobTrigger::Fail { .. }) => Some(S::Failed),
        (S::Running, JobTrigger::Cancel { .. }) => Some(S::Cancelled),
        (S::Running, JobTrigger::Timeout) => Some(S::TimedOut),
        (S::Running, JobTrigger::Reject { .. }) => Some(S::Pending),

        (S::Failed | S::TimedOut, JobTrigger::Retry) if attempt_count <= max_retries => {
            Some(S::Pending)
        }

        _ => None,
    }
}
