//! Session state and the transport abstraction.

use async_trait::async_trait;

use mesh_primitives::{AgentId, EnrollmentId};

use crate::error::HubResult;
use crate::protocol::ServerMessage;

/// Authentication state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no credentials presented yet.
    AwaitingAuth,
    /// Admitted with the bootstrap token; enrollment traffic only.
    PendingEnrollment {
        /// Recorded request, once `RequestEnrollment` has been handled.
        enrollment_id: Option<EnrollmentId>,
    },
    /// Fully authenticated.
    ///
    /// The agent id is fixed by the first authenticated frame: the
    /// certificate path pins it immediately, the anonymous path pins it at
    /// registration.
    Authenticated {
        /// The session's agent identity, once fixed.
        agent_id: Option<AgentId>,
    },
}

impl SessionState {
    /// Returns the fixed agent identity, if any.
    #[must_use]
    pub const fn agent_id(self) -> Option<AgentId> {
        match self {
            Self::Authenticated { agent_id } => agent_id,
            Self::AwaitingAuth | Self::PendingEnrollment { .. } => None,
        }
    }
}

/// One direction of a connected duplex channel.
///
/// Implementations must be reliable, ordered, and message-framed; the hub
/// never re-sends or re-orders. Closing the transport cancels the session.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Sends one message to the agent.
    async fn send(&self, message: ServerMessage) -> HubResult<()>;

    /// Closes the connection.
    async fn close(&self) -> HubResult<()>;
}
