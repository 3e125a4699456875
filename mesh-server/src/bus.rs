//! Typed publish/subscribe topics for orchestration events.
//!
//! Subscribers register at wiring time and receive events from the tasks
//! that produce them; there is no dynamic dispatch and no global registry
//! of listeners.

use tokio::sync::broadcast;

use mesh_enroll::EnrollmentStatus;
use mesh_jobs::JobEvent;
use mesh_primitives::{AgentId, EnrollmentId, JobId};

const TOPIC_CAPACITY: usize = 1024;

/// An admin decision on an enrollment request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnrollmentDecided {
    /// The decided request.
    pub enrollment_id: EnrollmentId,
    /// The recorded decision.
    pub status: EnrollmentStatus,
}

/// The server's internal event bus.
///
/// One broadcast channel per topic; a lagging subscriber loses old events
/// rather than blocking producers.
#[derive(Debug)]
pub struct EventBus {
    agent_connected: broadcast::Sender<AgentId>,
    agent_disconnected: broadcast::Sender<AgentId>,
    job_submitted: broadcast::Sender<JobId>,
    job_transitioned: broadcast::Sender<JobEvent>,
    job_completed: broadcast::Sender<JobId>,
    enrollment_decided: broadcast::Sender<EnrollmentDecided>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            agent_connected: broadcast::channel(TOPIC_CAPACITY).0,
            agent_disconnected: broadcast::channel(TOPIC_CAPACITY).0,
            job_submitted: broadcast::channel(TOPIC_CAPACITY).0,
            job_transitioned: broadcast::channel(TOPIC_CAPACITY).0,
            job_completed: broadcast::channel(TOPIC_CAPACITY).0,
            enrollment_decided: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }
}

impl EventBus {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to agent connections.
    #[must_use]
    pub fn agent_connected(&self) -> broadcast::Receiver<AgentId> {
        self.agent_connected.subscribe()
    }

    /// Subscribes to agent disconnections.
    #[must_use]
    pub fn agent_disconnected(&self) -> broadcast::Receiver<AgentId> {
        self.agent_disconnected.subscribe()
    }

    /// Subscribes to job submissions.
    #[must_use]
    pub fn job_submitted(&self) -> broadcast::Receiver<JobId> {
        self.job_submitted.subscribe()
    }

    /// Subscribes to every job state transition, in event-log order.
    #[must_use]
    pub fn job_transitioned(&self) -> broadcast::Receiver<JobEvent> {
        self.job_transitioned.subscribe()
    }

    /// Subscribes to terminal job outcomes.
    #[must_use]
    pub fn job_completed(&self) -> broadcast::Receiver<JobId> {
        self.job_completed.subscribe()
    }

    /// Subscribes to enrollment decisions.
    #[must_use]
    pub fn enrollment_decided(&self) -> broadcast::Receiver<EnrollmentDecided> {
        self.enrollment_decided.subscribe()
    }

    pub(crate) fn publish_agent_connected(&self, agent_id: AgentId) {
        let _ = self.agent_connected.send(agent_id);
    }

    pub(crate) fn publish_agent_disconnected(&self, agent_id: AgentId) {
        let _ = self.agent_disconnected.send(agent_id);
    }

    pub(crate) fn publish_job_event(&self, event: &JobEvent) {
        use mesh_jobs::JobEventKind;

        if matches!(event.kind, JobEventKind::Submitted) {
            let _ = self.job_submitted.send(event.job_id);
        }
        if matches!(
            event.kind,
            JobEventKind::Completed | JobEventKind::Cancelled { .. } | JobEventKind::DeadLettered
        ) {
            let _ = self.job_completed.send(event.job_id);
        }
        let _ = self.job_transitioned.send(event.clone());
    }

    pub(crate) fn publish_enrollment_decided(&self, decision: EnrollmentDecided) {
        let _ = self.enrollment_decided.send(decision);
    }
}
