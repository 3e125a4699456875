//! Trust-on-first-use enrollment for mesh nodes.
//!
//! A node's first contact is admitted with the bootstrap token and an admin
//! decision; subsequent contacts authenticate with the certificate issued at
//! approval. Sessions created through the bootstrap path are restricted to
//! enrollment calls until approved.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod request;
mod service;
mod store;

/// Error type and result alias for enrollment operations.
pub use error::{EnrollError, EnrollResult};
/// Enrollment request records and submission payloads.
pub use request::{EnrollmentRequest, EnrollmentStatus, EnrollmentSubmission};
/// Enrollment service implementing the admission paths.
pub use service::{EnrollmentOutcome, EnrollmentService, StatusReport};
/// Persistence traits and in-memory implementations.
pub use store::{EnrollmentStore, InMemoryEnrollmentStore};
