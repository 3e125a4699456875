//! Enrollment request records and node submissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mesh_primitives::{AgentId, CapabilitySet, EnrollmentId};

/// Decision state of an enrollment request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EnrollmentStatus {
    /// Awaiting an admin decision.
    Pending,
    /// Approved; a certificate has been issued.
    Approved,
    /// Rejected by an admin.
    Rejected,
    /// Timed out before a decision was made.
    Expired,
}

impl EnrollmentStatus {
    /// Returns `true` once a decision (or expiry) has been recorded.
    #[must_use]
    pub const fn is_decided(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Payload a node submits when requesting enrollment.
///
/// The node signs the canonical serialization of the identifying fields with
/// its own key, proving possession of the submitted public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentSubmission {
    /// Identity the node proposes for itself.
    pub node_id: AgentId,
    /// Human-readable node name.
    pub node_name: String,
    /// Hex-encoded Ed25519 public key of the node.
    pub public_key: String,
    /// Capabilities the node asks to be granted.
    pub requested_capabilities: CapabilitySet,
    /// Hex-encoded node signature over [`EnrollmentSubmission::signing_payload`].
    pub signature: String,
}

impl EnrollmentSubmission {
    /// Returns the canonical byte payload covered by the node signature.
    #[must_use]
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(self.node_id.as_uuid().as_bytes());
        payload.extend_from_slice(self.node_name.as_bytes());
        payload.extend_from_slice(self.public_key.as_bytes());
        for capability in self.requested_capabilities.iter() {
            payload.extend_from_slice(capability.as_str().as_bytes());
        }
        payload
    }
}

/// A recorded enrollment request awaiting or past its decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    /// Request identifier.
    pub enrollment_id: EnrollmentId,
    /// Node requesting admission.
    pub node_id: AgentId,
    /// Human-readable node name.
    pub node_name: String,
    /// Hex-encoded node public key.
    pub public_key: String,
    /// Capabilities the node requested.
    pub requested_capabilities: CapabilitySet,
    /// Hex-encoded node signature from the submission.
    pub signature: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Decision state.
    pub status: EnrollmentStatus,
}

impl EnrollmentRequest {
    /// Creates a pending request from a verified submission.
    #[must_use]
    pub fn from_submission(submission: EnrollmentSubmission) -> Self {
        Self {
            enrollment_id: EnrollmentId::random(),
            node_id: submission.node_id,
            node_name: submission.node_name,
            public_key: submission.public_key,
            requested_capabilities: submission.requested_capabilities,
            signature: submission.signature,
            submitted_at: Utc::now(),
            status: EnrollmentStatus::Pending,
        }
    }
}
