//! Error definitions for enrollment operations.

use mesh_credentials::CredentialError;
use mesh_primitives::{AgentId, Classify, EnrollmentId, ErrorKind};
use thiserror::Error;

/// Result alias for enrollment operations.
pub type EnrollResult<T> = Result<T, EnrollError>;

/// Errors surfaced by the enrollment service.
#[derive(Debug, Error)]
pub enum EnrollError {
    /// Bootstrap enrollment is disabled or no token is configured.
    #[error("bootstrap enrollment disabled")]
    BootstrapDisabled,

    /// The submission's node signature did not verify.
    #[error("enrollment submission signature invalid")]
    InvalidSignature,

    /// The node was blocked by a previous rejection.
    #[error("node {node_id} is blocked from enrollment")]
    NodeBlocked {
        /// The blocked node.
        node_id: AgentId,
    },

    /// The enrollment request expired before a decision was made.
    #[error("enrollment {enrollment_id} expired")]
    Expired {
        /// The expired request.
        enrollment_id: EnrollmentId,
    },

    /// No request exists with the given identifier.
    #[error("unknown enrollment {enrollment_id}")]
    UnknownEnrollment {
        /// The missing request identifier.
        enrollment_id: EnrollmentId,
    },

    /// The request has already been approved or rejected.
    #[error("enrollment {enrollment_id} already decided")]
    AlreadyDecided {
        /// The decided request identifier.
        enrollment_id: EnrollmentId,
    },

    /// Credential layer failure during admission or issuance.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Backing store failure.
    #[error("enrollment store error: {reason}")]
    Store {
        /// Human-readable context from the backend.
        reason: String,
    },
}

impl Classify for EnrollError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::BootstrapDisabled | Self::InvalidSignature | Self::NodeBlocked { .. } => {
                ErrorKind::Auth
            }
            Self::Expired { .. } | Self::UnknownEnrollment { .. } | Self::AlreadyDecided { .. } => {
                ErrorKind::State
            }
            Self::Credential(err) => err.kind(),
            Self::Store { .. } => ErrorKind::Transient,
        }
    }
}
