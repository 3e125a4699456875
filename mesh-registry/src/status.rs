//! Agent status transitions.

use mesh_primitives::AgentStatus;

/// Events that drive agent status changes.
///
/// Hub session activity and the heartbeat monitor produce these; the
/// registry applies them through [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// Begin bootstrapping after the record is created.
    Initialize,
    /// Bootstrapping finished; the agent can accept work.
    Initialized,
    /// The agent started executing at least one job.
    JobStarted,
    /// The agent finished its last in-flight job.
    JobsDrained,
    /// The agent paused work intake while staying connected.
    Pause,
    /// The agent resumed from a pause.
    Resume,
    /// A graceful shutdown began; in-flight work is draining.
    Stop,
    /// Draining finished; the agent is fully stopped.
    StopComplete,
    /// The agent reported an unrecoverable failure.
    Fault,
    /// The heartbeat monitor declared the agent silent.
    HeartbeatLost,
    /// The agent re-registered after a disconnect or stop.
    Reconnect,
}

/// Applies an event to a status, returning the next status if the
/// transition is permitted.
///
/// The table is exhaustive over the permitted pairs; anything else returns
/// `None` and the caller decides whether that is an error (explicit status
/// updates) or a no-op (redundant monitor events).
#[must_use]
pub fn transition(status: AgentStatus, event: AgentEvent) -> Option<AgentStatus> {
    use AgentStatus as S;

    match (status, event) {
        (S::Created, AgentEvent::Initialize) => Some(S::Initializing),
        (S::Initializing, AgentEvent::Initialized) => Some(S::Ready),
        (S::Initializing, AgentEvent::Fault) => Some(S::Faulted),

        (S::Ready, AgentEvent::JobStarted) => Some(S::Running),
        (S::Running, AgentEvent::JobsDrained) => Some(S::Ready),
        (S::Running, AgentEvent::Pause) => Some(S::Paused),
        (S::Paused, AgentEvent::Resume) => Some(S::Running),

        (S::Ready | S::Running | S::Paused, AgentEvent::Stop) => Some(S::Stopping),
        (S::Stopping, AgentEvent::StopComplete) => Some(S::Stopped),

        (S::Ready | S::Running | S::Paused, AgentEvent::Fault) => Some(S::Faulted),

        (
            S::Initializing | S::Ready | S::Running | S::Paused | S::Stopping,
            AgentEvent::HeartbeatLost,
        ) => Some(S::Disconnected),

        (S::Disconnected | S::Stopped | S::Faulted, AgentEvent::Reconnect) => Some(S::Ready),

        _ => None,
    }
}
