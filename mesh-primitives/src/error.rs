//! Shared error definitions and the server-wide failure taxonomy.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a failure, driving retry and surfacing policy.
///
/// Every component error maps into exactly one kind via [`Classify`]. The
/// resilience layer retries only [`ErrorKind::Transient`]; capacity failures
/// stay internal to the dispatcher; fatal failures refuse startup.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input; never retried, surfaced to the caller.
    Validation,
    /// Authentication or authorization failure; the session is aborted.
    Auth,
    /// Illegal state transition or reference to an unknown entity.
    State,
    /// Queue or eligibility exhaustion; handled inside the dispatcher.
    Capacity,
    /// Transport or timeout failure that may succeed on retry.
    Transient,
    /// Unrecoverable configuration or key-store failure.
    Fatal,
}

impl ErrorKind {
    /// Returns `true` when the resilience layer may retry the operation.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Trait implemented by component errors to expose their [`ErrorKind`].
pub trait Classify {
    /// Returns the taxonomy kind for this error.
    fn kind(&self) -> ErrorKind;
}

/// Errors that can occur while manipulating primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided identifier could not be parsed as a UUID.
    #[error("invalid identifier: {source}")]
    InvalidId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Capability identifier failed validation.
    #[error("invalid capability id `{id}`: {reason}")]
    InvalidCapabilityId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// A descriptor or record failed field validation.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Classify for Error {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}
