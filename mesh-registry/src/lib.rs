//! Agent presence registry for the mesh orchestrator.
//!
//! Tracks which agents are connected, their lifecycle status, advertised
//! capabilities, and heartbeat freshness. The heartbeat monitor marks silent
//! agents disconnected and notifies the dispatcher so in-flight work can be
//! reassigned.

#![warn(missing_docs, clippy::pedantic)]

mod monitor;
mod presence;
mod status;
mod store;

/// Heartbeat monitoring task and its configuration.
pub use monitor::{HeartbeatMonitor, MonitorConfig};
/// The in-memory presence table.
pub use presence::{AgentRegistry, AgentSnapshot, PresenceEvent};
/// Agent status transitions and events.
pub use status::{AgentEvent, transition};
/// Persistence trait for agent records.
pub use store::{AgentStore, InMemoryAgentStore};

use mesh_primitives::{AgentId, Classify, ConnectionId, ErrorKind};
use thiserror::Error;

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors surfaced by the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No agent is registered under the given identifier.
    #[error("unknown agent {agent_id}")]
    UnknownAgent {
        /// The missing agent identifier.
        agent_id: AgentId,
    },

    /// No agent is associated with the given connection.
    #[error("unknown connection {connection_id}")]
    UnknownConnection {
        /// The unmatched connection identifier.
        connection_id: ConnectionId,
    },

    /// The requested status change is not permitted.
    #[error("invalid status transition for agent {agent_id}: {from:?} via {event:?}")]
    InvalidTransition {
        /// Agent whose transition failed.
        agent_id: AgentId,
        /// Status prior to the attempted transition.
        from: mesh_primitives::AgentStatus,
        /// Event that triggered the failure.
        event: AgentEvent,
    },

    /// Backing store failure.
    #[error("agent store error: {reason}")]
    Store {
        /// Human-readable context from the backend.
        reason: String,
    },
}

impl Classify for RegistryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownAgent { .. }
            | Self::UnknownConnection { .. }
            | Self::InvalidTransition { .. } => ErrorKind::State,
            Self::Store { .. } => ErrorKind::Transient,
        }
    }
}
