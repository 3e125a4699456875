//! Error definitions for credential operations.

use mesh_primitives::{AgentId, Classify, ErrorKind};
use thiserror::Error;

/// Result alias for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;

/// Errors surfaced by the credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The server key-pair has not been initialized.
    #[error("server keys not initialized")]
    KeysUninitialized,

    /// A supplied key or signature could not be decoded.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What failed to decode (key, signature, certificate).
        what: &'static str,
        /// Decoder failure detail.
        reason: String,
    },

    /// The certificate signature did not verify under the server key.
    #[error("certificate signature invalid")]
    InvalidSignature,

    /// The certificate is outside its validity window.
    #[error("certificate expired or not yet valid")]
    Expired,

    /// The certificate was issued by a different server.
    #[error("certificate issuer mismatch: expected {expected}, found {found}")]
    WrongIssuer {
        /// This server's identifier.
        expected: String,
        /// Issuer recorded in the certificate.
        found: String,
    },

    /// The certificate serial is in the revocation set.
    #[error("certificate for node {node_id} is revoked")]
    Revoked {
        /// Node whose certificate was revoked.
        node_id: AgentId,
    },

    /// The presented bootstrap token did not match the stored hash.
    #[error("bootstrap token invalid")]
    InvalidToken,

    /// Bootstrap enrollment is disabled on this server.
    #[error("bootstrap enrollment disabled")]
    BootstrapDisabled,

    /// Backing store failure.
    #[error("credential store error: {reason}")]
    Store {
        /// Human-readable context from the backend.
        reason: String,
    },
}

impl CredentialError {
    /// Convenience helper to construct store errors.
    #[must_use]
    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }
}

impl Classify for CredentialError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::KeysUninitialized => ErrorKind::Fatal,
            Self::Malformed { .. } => ErrorKind::Validation,
            Self::InvalidSignature
            | Self::Expired
            | Self::WrongIssuer { .. }
            | Self::Revoked { .. }
            | Self::InvalidToken
            | Self::BootstrapDisabled => ErrorKind::Auth,
            Self::Store { .. } => ErrorKind::Transient,
        }
    }
}
