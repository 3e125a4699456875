//! Error definitions for hub operations.

use mesh_credentials::CredentialError;
use mesh_enroll::EnrollError;
use mesh_jobs::JobError;
use mesh_primitives::{Classify, ConnectionId, ErrorKind};
use mesh_registry::RegistryError;
use thiserror::Error;

/// Result alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors surfaced by the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// No session exists for the connection.
    #[error("unknown session {connection_id}")]
    UnknownSession {
        /// The unmatched connection identifier.
        connection_id: ConnectionId,
    },

    /// The session has not completed authentication.
    #[error("session not authenticated")]
    NotAuthenticated,

    /// The session is restricted to enrollment traffic.
    #[error("session restricted to enrollment calls")]
    EnrollmentOnly,

    /// The message is not permitted for this session's identity.
    #[error("message not permitted for this session: {reason}")]
    NotPermitted {
        /// Why the message was refused.
        reason: String,
    },

    /// Authentication failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Enrollment handling failed.
    #[error(transparent)]
    Enroll(#[from] EnrollError),

    /// Job handling failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Registry handling failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The transport refused or dropped an outbound message.
    #[error("transport closed: {reason}")]
    TransportClosed {
        /// Detail from the transport implementation.
        reason: String,
    },
}

impl Classify for HubError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSession { .. } => ErrorKind::State,
            Self::NotAuthenticated | Self::EnrollmentOnly | Self::NotPermitted { .. } => {
                ErrorKind::Auth
            }
            Self::Credential(err) => err.kind(),
            Self::Enroll(err) => err.kind(),
            Self::Job(err) => err.kind(),
            Self::Registry(err) => err.kind(),
            Self::TransportClosed { .. } => ErrorKind::Transient,
        }
    }
}
