//! Progress, result, and stream reporting types sent by agents.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A progress report for a running job.
///
/// Progress is lossy by contract: the server retains only the latest report
/// per job for new observers, while live observers see each report in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Job the report belongs to.
    pub job_id: JobId,
    /// Completion percentage in `0..=100`.
    pub percent: u8,
    /// Optional human-readable status line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time the report was produced on the agent.
    pub reported_at: DateTime<Utc>,
}

/// One ordered chunk of output produced by a running job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamItem {
    /// Job the item belongs to.
    pub job_id: JobId,
    /// Strictly increasing, contiguous sequence number within the job.
    pub sequence: u64,
    /// Opaque chunk payload.
    pub payload: Bytes,
    /// Marks the final item of the stream.
    #[serde(default)]
    pub is_end: bool,
}

/// Final outcome reported by the executing agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Job the result belongs to.
    pub job_id: JobId,
    /// `true` when the command completed successfully.
    pub success: bool,
    /// Opaque result payload.
    #[serde(default)]
    pub payload: Bytes,
    /// Error message when `success` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error code when `success` is `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl JobResult {
    /// Creates a successful result carrying the given payload.
    #[must_use]
    pub fn success(job_id: JobId, payload: Bytes) -> Self {
        Self {
            job_id,
            success: true,
            payload,
            error: None,
            error_code: None,
        }
    }

    /// Creates a failed result with an error message and code.
    #[must_use]
    pub fn failure(job_id: JobId, error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            payload: Bytes::new(),
            error: Some(error.into()),
            error_code: Some(code.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_constructors() {
        let id = JobId::random();
        let ok = JobResult::success(id, Bytes::from_static(b"out"));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = JobResult::failure(id, "boom", "E_EXEC");
        assert!(!failed.success);
        assert_eq!(failed.error_code.as_deref(), Some("E_EXEC"));
    }

    #[test]
    fn stream_item_serde_defaults() {
        let json = format!(r#"{{"job_id":"{}","sequence":3,"payload":[1,2]}}"#, JobId::random());
        let item: StreamItem = serde_json::from_str(&json).expect("decode");
        assert!(!item.is_end);
        assert_eq!(item.sequence, 3);
    }
}
