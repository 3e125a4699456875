//! Error definitions for job operations.

use mesh_primitives::{Classify, ErrorKind, JobId};
use thiserror::Error;

/// Result alias for job operations.
pub type JobsResult<T> = Result<T, JobError>;

/// Errors surfaced by the job engine.
#[derive(Debug, Error)]
pub enum JobError {
    /// A submission field failed validation.
    #[error("invalid job request: {reason}")]
    InvalidRequest {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// No job exists with the given identifier.
    #[error("unknown job {job_id}")]
    UnknownJob {
        /// The missing job identifier.
        job_id: JobId,
    },

    /// The job has reached a terminal status and cannot change.
    #[error("job {job_id} is terminal")]
    TerminalJob {
        /// The terminal job identifier.
        job_id: JobId,
    },

    /// Backing store failure.
    #[error("job store error: {reason}")]
    Store {
        /// Human-readable context from the backend.
        reason: String,
    },
}

impl JobError {
    /// Convenience helper to construct store errors.
    #[must_use]
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }
}

impl Classify for JobError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest { .. } => ErrorKind::Validation,
            Self::UnknownJob { .. } | Self::TerminalJob { .. } => ErrorKind::State,
            Self::Store { .. } => ErrorKind::Transient,
        }
    }
}

/// Extension helpers shared by job result handling.
pub trait JobResultExt<T> {
    /// Maps a missing record into [`JobError::UnknownJob`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] when the option is `None`.
    fn or_unknown(self, job_id: JobId) -> JobsResult<T>;
}

impl<T> JobResultExt<T> for Option<T> {
    fn or_unknown(self, job_id: JobId) -> JobsResult<T> {
        self.ok_or(JobError::UnknownJob { job_id })
    }
}
