//! Job lifecycle engine for the mesh orchestrator.
//!
//! Owns the authoritative job records: an idempotent store, the per-job
//! state machine, the append-only event log used for observability and
//! crash recovery, and the dead-letter sink for jobs that exhaust their
//! retry budget.

#![warn(missing_docs, clippy::pedantic)]

mod dead_letter;
mod error;
mod events;
mod fsm;
mod service;
mod store;

/// Dead-letter sink trait and in-memory implementation.
pub use dead_letter::{DeadLetterEntry, DeadLetterSink, InMemoryDeadLetter};
/// Error type and result alias for job operations.
pub use error::{JobError, JobResultExt, JobsResult};
/// Event log records and persistence.
pub use events::{EventLog, InMemoryEventLog, JobEvent, JobEventKind};
/// The job state machine: triggers and the pure transition table.
pub use fsm::{JobTrigger, next_status};
/// The job service coordinating store, state machine, and event log.
pub use service::{CancelOutcome, JobDefaults, JobService};
/// Job store trait and in-memory implementation.
pub use store::{InMemoryJobStore, InsertOutcome, JobStore};
