//! Per-message routing for inbound agent traffic.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;

use mesh_enroll::EnrollmentSubmission;
use mesh_primitives::{
    AgentDescriptor, AgentId, ConnectionId, EnrollmentId, JobId, JobProgress, JobResult,
    StreamItem,
};

use crate::error::{HubError, HubResult};
use crate::protocol::AgentMessage;

/// Context provided to message handlers.
#[derive(Clone, Copy, Debug)]
pub struct HandlerContext {
    connection_id: ConnectionId,
    received_at: Instant,
}

impl HandlerContext {
    /// Creates a context for a message received on a connection.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            received_at: Instant::now(),
        }
    }

    /// Returns the connection the message arrived on.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the time the message was received.
    #[must_use]
    pub const fn received_at(&self) -> Instant {
        self.received_at
    }
}

fn unsupported(name: &str) -> HubError {
    HubError::NotPermitted {
        reason: format!("message `{name}` is not supported"),
    }
}

/// Trait implemented by the server side of the session protocol.
///
/// Each inbound message type has its own method so implementations can
/// override selectively; the defaults refuse the message.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Called for `Register` messages.
    async fn handle_register(
        &self,
        ctx: HandlerContext,
        descriptor: AgentDescriptor,
    ) -> HubResult<()> {
        let _ = (ctx, descriptor);
        Err(unsupported("register"))
    }

    /// Called for `Unregister` messages.
    async fn handle_unregister(&self, ctx: HandlerContext, agent_id: AgentId) -> HubResult<()> {
        let _ = (ctx, agent_id);
        Err(unsupported("unregister"))
    }

    /// Called for `Heartbeat` messages.
    async fn handle_heartbeat(&self, ctx: HandlerContext, agent_id: AgentId) -> HubResult<()> {
        let _ = (ctx, agent_id);
        Err(unsupported("heartbeat"))
    }

    /// Called for `AckJob` messages.
    async fn handle_ack_job(&self, ctx: HandlerContext, job_id: JobId) -> HubResult<()> {
        let _ = (ctx, job_id);
        Err(unsupported("ack_job"))
    }

    /// Called for `NackJob` messages.
    async fn handle_nack_job(
        &self,
        ctx: HandlerContext,
        job_id: JobId,
        reason: String,
    ) -> HubResult<()> {
        let _ = (ctx, job_id, reason);
        Err(unsupported("nack_job"))
    }

    /// Called for `ReportProgress` messages.
    async fn handle_report_progress(
        &self,
        ctx: HandlerContext,
        progress: JobProgress,
    ) -> HubResult<()> {
        let _ = (ctx, progress);
        Err(unsupported("report_progress"))
    }

    /// Called for `ReportStream` messages.
    async fn handle_report_stream(&self, ctx: HandlerContext, item: StreamItem) -> HubResult<()> {
        let _ = (ctx, item);
        Err(unsupported("report_stream"))
    }

    /// Called for `ReportResult` messages.
    async fn handle_report_result(&self, ctx: HandlerContext, result: JobResult) -> HubResult<()> {
        let _ = (ctx, result);
        Err(unsupported("report_result"))
    }

    /// Called for `ReportState` messages.
    async fn handle_report_state(
        &self,
        ctx: HandlerContext,
        agent_id: AgentId,
        properties: HashMap<String, String>,
    ) -> HubResult<()> {
        let _ = (ctx, agent_id, properties);
        Err(unsupported("report_state"))
    }

    /// Called for `RequestEnrollment` messages.
    async fn handle_request_enrollment(
        &self,
        ctx: HandlerContext,
        submission: EnrollmentSubmission,
    ) -> HubResult<()> {
        let _ = (ctx, submission);
        Err(unsupported("request_enrollment"))
    }

    /// Called for `CheckEnrollmentStatus` messages.
    async fn handle_check_enrollment_status(
        &self,
        ctx: HandlerContext,
        enrollment_id: EnrollmentId,
    ) -> HubResult<()> {
        let _ = (ctx, enrollment_id);
        Err(unsupported("check_enrollment_status"))
    }
}

/// Dispatches a message to the appropriate handler method.
///
/// # Errors
///
/// Propagates errors returned by the underlying handler implementation.
pub async fn dispatch_message<H>(
    handler: &H,
    ctx: HandlerContext,
    message: AgentMessage,
) -> HubResult<()>
where
    H: SessionHandler + ?Sized,
{
    match message {
        AgentMessage::Register { descriptor } => handler.handle_register(ctx, descriptor).await,
        AgentMessage::Unregister { agent_id } => handler.handle_unregister(ctx, agent_id).await,
        AgentMessage::Heartbeat { agent_id } => handler.handle_heartbeat(ctx, agent_id).await,
        AgentMessage::AckJob { job_id } => handler.handle_ack_job(ctx, job_id).await,
        AgentMessage::NackJob { job_id, reason } => {
            handler.handle_nack_job(ctx, job_id, reason).await
        }
        AgentMessage::ReportProgress(progress) => {
            handler.handle_report_progress(ctx, progress).await
        }
        AgentMessage::ReportStream(item) => handler.handle_report_stream(ctx, item).await,
        AgentMessage::ReportResult(result) => handler.handle_report_result(ctx, result).await,
        AgentMessage::ReportState {
            agent_id,
            properties,
        } => handler.handle_report_state(ctx, agent_id, properties).await,
        AgentMessage::RequestEnrollment(submission) => {
            handler.handle_request_enrollment(ctx, submission).await
        }
        AgentMessage::CheckEnrollmentStatus { enrollment_id } => {
            handler.handle_check_enrollment_status(ctx, enrollment_id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        heartbeats: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionHandler for CountingHandler {
        async fn handle_heartbeat(
            &self,
            _ctx: HandlerContext,
            _agent_id: AgentId,
        ) -> HubResult<()> {
            self.heartbeats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_to_specific_handler() {
        let handler = CountingHandler {
            heartbeats: Arc::new(AtomicUsize::new(0)),
        };
        let ctx = HandlerContext::new(ConnectionId::random());

        dispatch_message(
            &handler,
            ctx,
            AgentMessage::Heartbeat {
                agent_id: AgentId::random(),
            },
        )
        .await
        .unwrap();

        assert_eq!(handler.heartbeats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unimplemented_message_is_refused() {
        let handler = CountingHandler {
            heartbeats: Arc::new(AtomicUsize::new(0)),
        };
        let ctx = HandlerContext::new(ConnectionId::random());

        let err = dispatch_message(
            &handler,
            ctx,
            AgentMessage::AckJob {
                job_id: JobId::random(),
            },
        )
        .await
        .expect_err("should refuse");
        assert!(matches!(err, HubError::NotPermitted { .. }));
    }
}
