//! The session protocol message sets.
//!
//! Payloads are opaque byte sequences; how messages are framed and encoded
//! on the wire is the transport's choice. These types are the contract the
//! server and its agents agree on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mesh_credentials::Certificate;
use mesh_enroll::{EnrollmentStatus, EnrollmentSubmission};
use mesh_primitives::{
    AgentDescriptor, AgentId, EnrollmentId, JobId, JobProgress, JobResult, StreamItem,
};

/// Authentication artifacts carried at session start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SessionAuth {
    /// A previously issued certificate plus proof of key possession: the
    /// node signs the server-provided nonce with its certificate key.
    Certificate {
        /// The presented certificate.
        certificate: Certificate,
        /// Nonce the node signed (issued by the server at connect).
        nonce: Vec<u8>,
        /// Hex-encoded node signature over the nonce.
        signature: String,
    },
    /// The deployment's bootstrap token; admits enrollment traffic only.
    BootstrapToken {
        /// Plaintext token as configured by the operator.
        token: String,
    },
    /// Legacy shared-secret authentication; the session's identity is fixed
    /// at registration instead of by the credential.
    ApiToken {
        /// The configured shared secret.
        token: String,
    },
    /// Development-only anonymous access; rejected unless enabled.
    Anonymous,
}

/// Messages an agent sends to the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AgentMessage {
    /// Announce identity and capabilities after authentication.
    Register {
        /// The agent's descriptor.
        descriptor: AgentDescriptor,
    },
    /// Leave the mesh permanently.
    Unregister {
        /// The departing agent.
        agent_id: AgentId,
    },
    /// Liveness signal.
    Heartbeat {
        /// The beating agent.
        agent_id: AgentId,
    },
    /// Accept an assignment.
    AckJob {
        /// The acknowledged job.
        job_id: JobId,
    },
    /// Refuse an assignment.
    NackJob {
        /// The refused job.
        job_id: JobId,
        /// Why the agent cannot run it.
        reason: String,
    },
    /// Report execution progress; lossy, latest wins for new observers.
    ReportProgress(JobProgress),
    /// Emit one ordered output chunk.
    ReportStream(StreamItem),
    /// Report the final outcome; idempotent per job.
    ReportResult(JobResult),
    /// Answer a server state request with reported properties.
    ReportState {
        /// The reporting agent.
        agent_id: AgentId,
        /// Free-form reported properties.
        properties: HashMap<String, String>,
    },
    /// Ask to join the mesh using the bootstrap path.
    RequestEnrollment(EnrollmentSubmission),
    /// Poll the decision on a pending enrollment.
    CheckEnrollmentStatus {
        /// The enrollment being polled.
        enrollment_id: EnrollmentId,
    },
}

impl AgentMessage {
    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Unregister { .. } => "unregister",
            Self::Heartbeat { .. } => "heartbeat",
            Self::AckJob { .. } => "ack_job",
            Self::NackJob { .. } => "nack_job",
            Self::ReportProgress(_) => "report_progress",
            Self::ReportStream(_) => "report_stream",
            Self::ReportResult(_) => "report_result",
            Self::ReportState { .. } => "report_state",
            Self::RequestEnrollment(_) => "request_enrollment",
            Self::CheckEnrollmentStatus { .. } => "check_enrollment_status",
        }
    }

    /// Returns `true` when a pending-enrollment session may send this.
    #[must_use]
    pub const fn allowed_while_pending(&self) -> bool {
        matches!(
            self,
            Self::RequestEnrollment(_) | Self::CheckEnrollmentStatus { .. }
        )
    }
}

/// Messages the server sends to an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Hand a job to the agent; must be answered with ack or nack.
    AssignJob(mesh_primitives::Job),
    /// Stop a running job within the grace window.
    CancelJob {
        /// The cancelled job.
        job_id: JobId,
        /// Caller-supplied reason.
        reason: String,
    },
    /// Ask the agent to report its current state.
    RequestState {
        /// The queried agent.
        agent_id: AgentId,
    },
    /// An enrollment request was recorded and awaits a decision.
    EnrollmentPending {
        /// Identifier to poll with.
        enrollment_id: EnrollmentId,
    },
    /// The decision on an enrollment request.
    EnrollmentDecision {
        /// The decided enrollment.
        enrollment_id: EnrollmentId,
        /// Decision state.
        status: EnrollmentStatus,
        /// Certificate issued on approval.
        certificate: Option<Certificate>,
    },
    /// Protocol-level error notification.
    Error {
        /// Machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}
