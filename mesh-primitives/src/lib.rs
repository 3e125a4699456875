//! Core shared types for the mesh orchestration server.

#![warn(missing_docs, clippy::pedantic)]

mod agent;
mod capability;
mod error;
mod ids;
mod job;
mod report;

/// Agent identity, capabilities, and lifecycle status.
pub use agent::{AgentDescriptor, AgentDescriptorBuilder, AgentStatus};
/// Capability descriptors and set matching.
pub use capability::{Capability, CapabilityId, CapabilitySet};
/// Error taxonomy and result alias shared across the server.
pub use error::{Classify, Error, ErrorKind, Result};
/// Identifier newtypes used throughout the mesh.
pub use ids::{AgentId, CertificateSerial, ConnectionId, EnrollmentId, JobId};
/// Job records, submission requests, and lifecycle status.
pub use job::{Job, JobRequest, JobStatus, SubmitReceipt};
/// Progress, result, and stream reporting types.
pub use report::{JobProgress, JobResult, StreamItem};
