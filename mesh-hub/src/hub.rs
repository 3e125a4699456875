//! The hub: session ownership and message routing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mesh_credentials::{CredentialError, CredentialService};
use mesh_dispatch::{Dispatcher, Resilience};
use mesh_enroll::{EnrollmentOutcome, EnrollmentService, EnrollmentStatus, EnrollmentSubmission};
use mesh_jobs::JobService;
use mesh_primitives::{
    AgentDescriptor, AgentId, AgentStatus, ConnectionId, EnrollmentId, JobId, JobProgress,
    JobResult, StreamItem,
};
use mesh_registry::{AgentEvent, AgentRegistry, RegistryError};

use crate::error::{HubError, HubResult};
use crate::handlers::{HandlerContext, SessionHandler, dispatch_message};
use crate::protocol::{AgentMessage, ServerMessage, SessionAuth};
use crate::session::{SessionState, SessionTransport};
use crate::streams::StreamRelay;

/// Authentication policy for incoming sessions.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Reject any session that does not present a valid certificate.
    pub require_certificate_auth: bool,
    /// Development-only: admit sessions with no credentials at all.
    pub allow_anonymous: bool,
    /// Legacy shared secret accepted in place of a certificate.
    pub api_token: Option<String>,
}

struct Session {
    state: SessionState,
    transport: Arc<dyn SessionTransport>,
    bootstrap_token: Option<String>,
    pump: Option<JoinHandle<()>>,
}

/// The session layer of the mesh server.
///
/// Owns every live connection, fixes each session to one agent identity,
/// and glues inbound protocol traffic to the registry, the job engine, and
/// the dispatcher. Outbound sends go through the resilience wrapper.
pub struct Hub {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    jobs: Arc<JobService>,
    credentials: Arc<CredentialService>,
    enrollment: Arc<EnrollmentService>,
    streams: Arc<StreamRelay>,
    resilience: Arc<Resilience>,
    sessions: DashMap<ConnectionId, Session>,
    reported_state: DashMap<AgentId, HashMap<String, String>>,
    config: HubConfig,
}

impl Hub {
    /// Creates a hub over the orchestration services.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<Dispatcher>,
        jobs: Arc<JobService>,
        credentials: Arc<CredentialService>,
        enrollment: Arc<EnrollmentService>,
        streams: Arc<StreamRelay>,
        resilience: Arc<Resilience>,
        config: HubConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            jobs,
            credentials,
            enrollment,
            streams,
            resilience,
            sessions: DashMap::new(),
            reported_state: DashMap::new(),
            config,
        }
    }

    /// Accepts a new connection, returning its session identifier.
    pub fn open_session(&self, transport: Arc<dyn SessionTransport>) -> ConnectionId {
        let connection_id = ConnectionId::random();
        self.sessions.insert(
            connection_id,
            Session {
                state: SessionState::AwaitingAuth,
                transport,
                bootstrap_token: None,
                pump: None,
            },
        );
        debug!(connection_id = %connection_id, "session opened");
        connection_id
    }

    /// Authenticates a session with the presented artifacts.
    ///
    /// Allowed from `AwaitingAuth` and from `PendingEnrollment` (so an
    /// approved node can upgrade with its new certificate without
    /// reconnecting). The certificate path fixes the session's agent id.
    ///
    /// # Errors
    ///
    /// Returns the credential failure for a bad certificate or token, or
    /// [`HubError::NotPermitted`] when policy forbids the method.
    pub async fn authenticate(
        &self,
        connection_id: ConnectionId,
        auth: SessionAuth,
    ) -> HubResult<SessionState> {
        // Credential checks call into the stores; no session entry may be
        // held across these awaits.
        let (next_state, token) = match auth {
            SessionAuth::Certificate {
                certificate,
                nonce,
                signature,
            } => {
                let node_id = self.credentials.validate_certificate(&certificate).await?;
                self.credentials.verify_node_signature(
                    &certificate.public_key,
                    &nonce,
                    &signature,
                )?;
                info!(connection_id = %connection_id, node_id = %node_id, "session authenticated by certificate");
                (
                    SessionState::Authenticated {
                        agent_id: Some(node_id),
                    },
                    None,
                )
            }
            SessionAuth::BootstrapToken { token } => {
                if self.config.require_certificate_auth {
                    return Err(HubError::NotPermitted {
                        reason: "certificate authentication required".into(),
                    });
                }
                self.credentials.verify_bootstrap_token(&token).await?;
                info!(connection_id = %connection_id, "session admitted for enrollment");
                (
                    SessionState::PendingEnrollment {
                        enrollment_id: None,
                    },
                    Some(token),
                )
            }
            SessionAuth::ApiToken { token } => {
                if self.config.require_certificate_auth {
                    return Err(HubError::NotPermitted {
                        reason: "certificate authentication required".into(),
                    });
                }
                match &self.config.api_token {
                    Some(expected) if *expected == token => {
                        info!(connection_id = %connection_id, "session authenticated by api token");
                        (SessionState::Authenticated { agent_id: None }, None)
                    }
                    _ => return Err(HubError::Credential(CredentialError::InvalidToken)),
                }
            }
            SessionAuth::Anonymous => {
                if !self.config.allow_anonymous {
                    return Err(HubError::NotPermitted {
                        reason: "anonymous sessions disabled".into(),
                    });
                }
                (SessionState::Authenticated { agent_id: None }, None)
            }
        };

        let mut session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(HubError::UnknownSession { connection_id })?;
        match session.state {
            SessionState::AwaitingAuth | SessionState::PendingEnrollment { .. } => {
                session.state = next_state;
                session.bootstrap_token = token;
                Ok(session.state)
            }
            SessionState::Authenticated { .. } => Err(HubError::NotPermitted {
                reason: "session already authenticated".into(),
            }),
        }
    }

    /// Routes one inbound message from a session.
    ///
    /// Pending-enrollment sessions may only send enrollment calls; anything
    /// else is refused without terminating the session.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::NotAuthenticated`] or
    /// [`HubError::EnrollmentOnly`] for state violations, and propagates
    /// handler failures.
    pub async fn handle_message(
        &self,
        connection_id: ConnectionId,
        message: AgentMessage,
    ) -> HubResult<()> {
        let state = self.session_state(connection_id)?;
        match state {
            SessionState::AwaitingAuth => return Err(HubError::NotAuthenticated),
            SessionState::PendingEnrollment { .. } if !message.allowed_while_pending() => {
                return Err(HubError::EnrollmentOnly);
            }
            _ => {}
        }

        dispatch_message(self, HandlerContext::new(connection_id), message).await
    }

    /// Closes a session, reassigning any in-flight work of its agent.
    ///
    /// Connection-level cancellation: all outstanding hub calls for the
    /// session die with the transport, and the agent's jobs go back to the
    /// queue.
    pub async fn close_session(&self, connection_id: ConnectionId) {
        let Some((_, session)) = self.sessions.remove(&connection_id) else {
            return;
        };
        if let Some(pump) = session.pump {
            pump.abort();
        }
        if let Some(agent_id) = session.state.agent_id() {
            if self.registry.mark_disconnected(agent_id) {
                self.dispatcher.handle_disconnect(agent_id).await;
            }
        }
        info!(connection_id = %connection_id, "session closed");
    }

    /// Cancels a job, propagating the signal to the owning agent when the
    /// job is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`mesh_jobs::JobError::UnknownJob`] via [`HubError::Job`]
    /// for a missing job.
    pub async fn cancel_job(&self, job_id: JobId, reason: impl Into<String>) -> HubResult<bool> {
        let reason = reason.into();
        let outcome = self.jobs.cancel(job_id, reason.clone()).await?;

        if let Some(agent_id) = outcome.notify_agent {
            if let Err(err) = self
                .send_to_agent(
                    agent_id,
                    ServerMessage::CancelJob { job_id, reason },
                    "hub.cancel",
                )
                .await
            {
                warn!(job_id = %job_id, agent_id = %agent_id, ?err, "cancel propagation failed");
            }
        }
        Ok(outcome.cancelled)
    }

    /// Asks an agent to report its current state.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Registry`] when the agent is not connected, or a
    /// transport failure.
    pub async fn request_state(&self, agent_id: AgentId) -> HubResult<()> {
        self.send_to_agent(agent_id, ServerMessage::RequestState { agent_id }, "hub.state")
            .await
    }

    /// Returns the most recent state report from an agent.
    #[must_use]
    pub fn reported_state(&self, agent_id: AgentId) -> Option<HashMap<String, String>> {
        self.reported_state.get(&agent_id).map(|s| s.clone())
    }

    /// Returns the stream relay for subscriber access.
    #[must_use]
    pub fn streams(&self) -> &Arc<StreamRelay> {
        &self.streams
    }

    fn session_state(&self, connection_id: ConnectionId) -> HubResult<SessionState> {
        self.sessions
            .get(&connection_id)
            .map(|s| s.state)
            .ok_or(HubError::UnknownSession { connection_id })
    }

    fn session_agent(&self, connection_id: ConnectionId) -> HubResult<Option<AgentId>> {
        Ok(self.session_state(connection_id)?.agent_id())
    }

    fn ensure_session_owns(
        &self,
        connection_id: ConnectionId,
        agent_id: AgentId,
    ) -> HubResult<()> {
        match self.session_agent(connection_id)? {
            Some(fixed) if fixed == agent_id => Ok(()),
            Some(fixed) => Err(HubError::NotPermitted {
                reason: format!("session is bound to agent {fixed}, not {agent_id}"),
            }),
            // Anonymous sessions have no fixed identity until registration.
            None => Ok(()),
        }
    }

    async fn send_to_agent(
        &self,
        agent_id: AgentId,
        message: ServerMessage,
        operation: &str,
    ) -> HubResult<()> {
        let connection_id = self
            .registry
            .get(agent_id)
            .and_then(|snapshot| snapshot.connection_id)
            .ok_or(HubError::Registry(RegistryError::UnknownAgent { agent_id }))?;
        let transport = self
            .sessions
            .get(&connection_id)
            .map(|s| Arc::clone(&s.transport))
            .ok_or(HubError::UnknownSession { connection_id })?;

        self.resilience
            .call(operation, || {
                let transport = Arc::clone(&transport);
                let message = message.clone();
                async move { transport.send(message).await }
            })
            .await
            .map_err(|err| HubError::TransportClosed {
                reason: err.to_string(),
            })
    }

    /// Spawns the outbound pump forwarding dispatcher assignments to the
    /// session transport.
    fn spawn_pump(
        &self,
        agent_id: AgentId,
        transport: Arc<dyn SessionTransport>,
    ) -> JoinHandle<()> {
        let mut lane = self.dispatcher.attach_agent(agent_id);
        let resilience = Arc::clone(&self.resilience);

        tokio::spawn(async move {
            while let Some(job) = lane.recv().await {
                let job_id = job.id;
                let outcome = resilience
                    .call("hub.assign", || {
                        let transport = Arc::clone(&transport);
                        let message = ServerMessage::AssignJob(job.clone());
                        async move { transport.send(message).await }
                    })
                    .await;
                if let Err(err) = outcome {
                    // The acknowledgement timer requeues the job.
                    warn!(job_id = %job_id, agent_id = %agent_id, ?err, "assignment send failed");
                }
            }
            debug!(agent_id = %agent_id, "outbound pump stopped");
        })
    }

    // Refreshes the Ready/Running status pair from the agent's remaining
    // in-flight work.
    async fn refresh_agent_load(&self, agent_id: AgentId) {
        let Ok(in_flight) = self.jobs.list_by_agent(agent_id).await else {
            return;
        };
        let Some(snapshot) = self.registry.get(agent_id) else {
            return;
        };
        let event = match (snapshot.status, in_flight.is_empty()) {
            (AgentStatus::Ready, false) => AgentEvent::JobStarted,
            (AgentStatus::Running, true) => AgentEvent::JobsDrained,
            _ => return,
        };
        if let Err(err) = self.registry.update_status(agent_id, event) {
            debug!(agent_id = %agent_id, ?err, "agent load refresh skipped");
        }
    }
}

#[async_trait]
impl SessionHandler for Hub {
    async fn handle_register(
        &self,
        ctx: HandlerContext,
        descriptor: AgentDescriptor,
    ) -> HubResult<()> {
        let connection_id = ctx.connection_id();
        let agent_id = descriptor.id();

        if let Some(fixed) = self.session_agent(connection_id)? {
            if fixed != agent_id {
                return Err(HubError::NotPermitted {
                    reason: format!("session is bound to agent {fixed}, not {agent_id}"),
                });
            }
        }

        let transport = {
            let mut session = self
                .sessions
                .get_mut(&connection_id)
                .ok_or(HubError::UnknownSession { connection_id })?;
            session.state = SessionState::Authenticated {
                agent_id: Some(agent_id),
            };
            Arc::clone(&session.transport)
        };

        self.registry.register(descriptor, connection_id).await?;
        let pump = self.spawn_pump(agent_id, transport);
        if let Some(mut session) = self.sessions.get_mut(&connection_id) {
            if let Some(old) = session.pump.replace(pump) {
                old.abort();
            }
        }
        self.dispatcher.kick();
        Ok(())
    }

    async fn handle_unregister(&self, ctx: HandlerContext, agent_id: AgentId) -> HubResult<()> {
        self.ensure_session_owns(ctx.connection_id(), agent_id)?;

        self.dispatcher.detach_agent(agent_id);
        self.registry.unregister(agent_id).await?;
        self.close_session(ctx.connection_id()).await;
        Ok(())
    }

    async fn handle_heartbeat(&self, ctx: HandlerContext, agent_id: AgentId) -> HubResult<()> {
        self.ensure_session_owns(ctx.connection_id(), agent_id)?;

        if let Err(err) = self.registry.update_heartbeat(agent_id, Utc::now()) {
            warn!(agent_id = %agent_id, ?err, "heartbeat for unknown agent ignored");
        }
        Ok(())
    }

    async fn handle_ack_job(&self, ctx: HandlerContext, job_id: JobId) -> HubResult<()> {
        let agent_id = self.session_agent(ctx.connection_id())?;

        match self.dispatcher.on_ack(job_id).await {
            Ok(true) => {
                if let Some(agent_id) = agent_id {
                    self.refresh_agent_load(agent_id).await;
                }
            }
            Ok(false) => {
                warn!(job_id = %job_id, "illegal acknowledgement ignored");
            }
            Err(err) => {
                warn!(job_id = %job_id, ?err, "acknowledgement for unknown job ignored");
            }
        }
        Ok(())
    }

    async fn handle_nack_job(
        &self,
        ctx: HandlerContext,
        job_id: JobId,
        reason: String,
    ) -> HubResult<()> {
        let _ = self.session_agent(ctx.connection_id())?;

        if let Err(err) = self.dispatcher.on_nack(job_id, reason).await {
            warn!(job_id = %job_id, ?err, "nack for unknown job ignored");
        }
        Ok(())
    }

    async fn handle_report_progress(
        &self,
        _ctx: HandlerContext,
        progress: JobProgress,
    ) -> HubResult<()> {
        match self.jobs.set_progress(progress.clone()).await {
            Ok(true) => self.streams.publish_progress(progress),
            Ok(false) => {}
            Err(err) => {
                warn!(job_id = %progress.job_id, ?err, "progress for unknown job ignored");
            }
        }
        Ok(())
    }

    async fn handle_report_stream(&self, _ctx: HandlerContext, item: StreamItem) -> HubResult<()> {
        self.streams.publish(item);
        Ok(())
    }

    async fn handle_report_result(&self, ctx: HandlerContext, result: JobResult) -> HubResult<()> {
        let agent_id = self.session_agent(ctx.connection_id())?;
        let job_id = result.job_id;

        match self.dispatcher.on_result(result).await {
            Ok(true) => {
                if let Some(agent_id) = agent_id {
                    self.refresh_agent_load(agent_id).await;
                }
            }
            Ok(false) => {
                debug!(job_id = %job_id, "duplicate result discarded");
            }
            Err(err) => {
                warn!(job_id = %job_id, ?err, "result for unknown job ignored");
            }
        }
        Ok(())
    }

    async fn handle_report_state(
        &self,
        ctx: HandlerContext,
        agent_id: AgentId,
        properties: HashMap<String, String>,
    ) -> HubResult<()> {
        self.ensure_session_owns(ctx.connection_id(), agent_id)?;
        self.reported_state.insert(agent_id, properties);
        Ok(())
    }

    async fn handle_request_enrollment(
        &self,
        ctx: HandlerContext,
        submission: EnrollmentSubmission,
    ) -> HubResult<()> {
        let connection_id = ctx.connection_id();

        let (token, transport) = {
            let session = self
                .sessions
                .get(&connection_id)
                .ok_or(HubError::UnknownSession { connection_id })?;
            (
                session.bootstrap_token.clone(),
                Arc::clone(&session.transport),
            )
        };
        let token = token.ok_or(HubError::NotAuthenticated)?;

        let outcome = self
            .enrollment
            .request_enrollment(&token, submission)
            .await?;

        let reply = match outcome {
            EnrollmentOutcome::Pending(enrollment_id) => {
                if let Some(mut session) = self.sessions.get_mut(&connection_id) {
                    session.state = SessionState::PendingEnrollment {
                        enrollment_id: Some(enrollment_id),
                    };
                }
                ServerMessage::EnrollmentPending { enrollment_id }
            }
            EnrollmentOutcome::Approved {
                enrollment_id,
                certificate,
            } => ServerMessage::EnrollmentDecision {
                enrollment_id,
                status: EnrollmentStatus::Approved,
                certificate: Some(certificate),
            },
        };
        transport.send(reply).await
    }

    async fn handle_check_enrollment_status(
        &self,
        ctx: HandlerContext,
        enrollment_id: EnrollmentId,
    ) -> HubResult<()> {
        let connection_id = ctx.connection_id();

        let report = self.enrollment.check_status(enrollment_id).await?;
        let transport = self
            .sessions
            .get(&connection_id)
            .map(|s| Arc::clone(&s.transport))
            .ok_or(HubError::UnknownSession { connection_id })?;

        transport
            .send(ServerMessage::EnrollmentDecision {
                enrollment_id,
                status: report.status,
                certificate: report.certificate,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mesh_credentials::{
        InMemoryBootstrapTokenStore, InMemoryCertificateStore, InMemoryRevocationStore,
    };
    use mesh_dispatch::{DispatcherConfig, ResilienceConfig, RetryPolicy};
    use mesh_enroll::InMemoryEnrollmentStore;
    use mesh_jobs::{InMemoryDeadLetter, InMemoryEventLog, InMemoryJobStore, JobDefaults};
    use mesh_primitives::{Capability, CapabilityId, CapabilitySet, JobRequest, JobStatus};
    use tokio::sync::mpsc;

    struct ChannelTransport {
        tx: mpsc::UnboundedSender<ServerMessage>,
    }

    #[async_trait]
    impl SessionTransport for ChannelTransport {
        async fn send(&self, message: ServerMessage) -> HubResult<()> {
            self.tx
                .send(message)
                .map_err(|_| HubError::TransportClosed {
                    reason: "receiver dropped".into(),
                })
        }

        async fn close(&self) -> HubResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        jobs: Arc<JobService>,
        credentials: Arc<CredentialService>,
        _loop_handle: JoinHandle<()>,
    }

    async fn fixture(config: HubConfig) -> Fixture {
        let registry = Arc::new(AgentRegistry::in_memory());
        let jobs = Arc::new(JobService::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryEventLog::default()),
            Arc::new(InMemoryDeadLetter::default()),
            JobDefaults {
                timeout: Duration::from_secs(5),
                max_retries: 2,
            },
        ));
        let dispatcher = Dispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            DispatcherConfig {
                per_agent_queue: 4,
                ack_timeout: Duration::from_millis(200),
                tick_interval: Duration::from_millis(20),
                retry: RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
            },
        );
        let (_disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let loop_handle = dispatcher.start(disconnect_rx).await;

        let credentials = Arc::new(CredentialService::new(
            Arc::new(InMemoryCertificateStore::default()),
            Arc::new(InMemoryRevocationStore::default()),
            Arc::new(InMemoryBootstrapTokenStore::default()),
        ));
        credentials.initialize_server_keys().await;

        let enrollment = Arc::new(EnrollmentService::new(
            Arc::new(InMemoryEnrollmentStore::default()),
            Arc::clone(&credentials),
            chrono::Duration::days(30),
            chrono::Duration::hours(24),
        ));

        let hub = Arc::new(Hub::new(
            registry,
            dispatcher,
            Arc::clone(&jobs),
            Arc::clone(&credentials),
            enrollment,
            Arc::new(StreamRelay::new()),
            Arc::new(Resilience::new(ResilienceConfig {
                max_attempts: 2,
                retry_delay: Duration::from_millis(5),
                call_timeout: Duration::from_millis(500),
                breaker: mesh_dispatch::BreakerConfig::default(),
            })),
            config,
        ));

        Fixture {
            hub,
            jobs,
            credentials,
            _loop_handle: loop_handle,
        }
    }

    fn transport() -> (Arc<ChannelTransport>, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelTransport { tx }), rx)
    }

    fn descriptor(capability: &str) -> AgentDescriptor {
        AgentDescriptor::builder(AgentId::random())
            .name("worker")
            .unwrap()
            .version("0.1.0")
            .unwrap()
            .capabilities(vec![
                Capability::new(CapabilityId::new(capability).unwrap(), "1.0").unwrap(),
            ])
            .build()
            .unwrap()
    }

    async fn connect_agent(
        fixture: &Fixture,
        descriptor: AgentDescriptor,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (transport, rx) = transport();
        let connection_id = fixture.hub.open_session(transport);
        fixture
            .hub
            .authenticate(connection_id, SessionAuth::Anonymous)
            .await
            .unwrap();
        fixture
            .hub
            .handle_message(connection_id, AgentMessage::Register { descriptor })
            .await
            .unwrap();
        (connection_id, rx)
    }

    #[tokio::test]
    async fn unauthenticated_traffic_is_refused() {
        let fixture = fixture(HubConfig {
            allow_anonymous: true,
            ..HubConfig::default()
        })
        .await;
        let (transport, _rx) = transport();
        let connection_id = fixture.hub.open_session(transport);

        let err = fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::Heartbeat {
                    agent_id: AgentId::random(),
                },
            )
            .await
            .expect_err("must refuse");
        assert!(matches!(err, HubError::NotAuthenticated));
    }

    #[tokio::test]
    async fn anonymous_disabled_by_default() {
        let fixture = fixture(HubConfig::default()).await;
        let (transport, _rx) = transport();
        let connection_id = fixture.hub.open_session(transport);

        let err = fixture
            .hub
            .authenticate(connection_id, SessionAuth::Anonymous)
            .await
            .expect_err("must refuse");
        assert!(matches!(err, HubError::NotPermitted { .. }));
    }

    #[tokio::test]
    async fn register_assign_ack_result_flow() {
        let fixture = fixture(HubConfig {
            allow_anonymous: true,
            ..HubConfig::default()
        })
        .await;
        let agent = descriptor("gpu");
        let (connection_id, mut rx) = connect_agent(&fixture, agent).await;

        let mut request = JobRequest::new("render");
        request.required_capabilities =
            [CapabilityId::new("gpu").unwrap()].into_iter().collect();
        let job_id = fixture.jobs.submit(request).await.unwrap().job_id();

        // The dispatcher pushes the assignment through the pump.
        let assigned = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("assignment sent")
            .expect("transport open");
        let ServerMessage::AssignJob(job) = assigned else {
            panic!("expected assignment, got {assigned:?}");
        };
        assert_eq!(job.id, job_id);

        fixture
            .hub
            .handle_message(connection_id, AgentMessage::AckJob { job_id })
            .await
            .unwrap();
        assert_eq!(
            fixture.jobs.get(job_id).await.unwrap().status,
            JobStatus::Running
        );

        fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::ReportResult(JobResult::success(
                    job_id,
                    bytes::Bytes::from_static(b"out"),
                )),
            )
            .await
            .unwrap();
        assert_eq!(
            fixture.jobs.get(job_id).await.unwrap().status,
            JobStatus::Completed
        );

        // Duplicate results are acknowledged and discarded.
        fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::ReportResult(JobResult::success(job_id, bytes::Bytes::new())),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pending_enrollment_session_is_restricted() {
        let fixture = fixture(HubConfig::default()).await;
        let issued = fixture
            .credentials
            .regenerate_bootstrap_token(false)
            .await
            .unwrap();

        let (transport, _rx) = transport();
        let connection_id = fixture.hub.open_session(transport);
        let state = fixture
            .hub
            .authenticate(
                connection_id,
                SessionAuth::BootstrapToken {
                    token: issued.plaintext,
                },
            )
            .await
            .unwrap();
        assert!(matches!(state, SessionState::PendingEnrollment { .. }));

        let err = fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::Heartbeat {
                    agent_id: AgentId::random(),
                },
            )
            .await
            .expect_err("job traffic must be refused");
        assert!(matches!(err, HubError::EnrollmentOnly));
    }

    #[tokio::test]
    async fn cancel_propagates_to_owning_agent() {
        let fixture = fixture(HubConfig {
            allow_anonymous: true,
            ..HubConfig::default()
        })
        .await;
        let agent = descriptor("gpu");
        let (connection_id, mut rx) = connect_agent(&fixture, agent).await;

        let mut request = JobRequest::new("render");
        request.required_capabilities =
            [CapabilityId::new("gpu").unwrap()].into_iter().collect();
        let job_id = fixture.jobs.submit(request).await.unwrap().job_id();

        let _assigned = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("assignment")
            .expect("open");
        fixture
            .hub
            .handle_message(connection_id, AgentMessage::AckJob { job_id })
            .await
            .unwrap();

        assert!(fixture.hub.cancel_job(job_id, "operator").await.unwrap());
        let cancel = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("cancel sent")
            .expect("open");
        assert!(matches!(cancel, ServerMessage::CancelJob { job_id: id, .. } if id == job_id));
        assert_eq!(
            fixture.jobs.get(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn session_identity_is_fixed_by_first_frame() {
        let fixture = fixture(HubConfig {
            allow_anonymous: true,
            ..HubConfig::default()
        })
        .await;
        let agent = descriptor("cpu");
        let agent_id = agent.id();
        let (connection_id, _rx) = connect_agent(&fixture, agent).await;

        // A heartbeat for some other agent is an identity violation.
        let err = fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::Heartbeat {
                    agent_id: AgentId::random(),
                },
            )
            .await
            .expect_err("wrong identity");
        assert!(matches!(err, HubError::NotPermitted { .. }));

        // The bound identity still works.
        fixture
            .hub
            .handle_message(connection_id, AgentMessage::Heartbeat { agent_id })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stream_items_fan_out_with_replay() {
        let fixture = fixture(HubConfig {
            allow_anonymous: true,
            ..HubConfig::default()
        })
        .await;
        let agent = descriptor("gpu");
        let (connection_id, _rx) = connect_agent(&fixture, agent).await;
        let job_id = JobId::random();

        for sequence in 0..3u64 {
            fixture
                .hub
                .handle_message(
                    connection_id,
                    AgentMessage::ReportStream(StreamItem {
                        job_id,
                        sequence,
                        payload: bytes::Bytes::from(sequence.to_string()),
                        is_end: sequence == 2,
                    }),
                )
                .await
                .unwrap();
        }

        let subscription = fixture.hub.streams().subscribe(job_id);
        let sequences: Vec<u64> = subscription.replay.iter().map(|i| i.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(subscription.replay.last().unwrap().is_end);
    }

    #[tokio::test]
    async fn certificate_auth_fixes_identity() {
        let fixture = fixture(HubConfig {
            require_certificate_auth: true,
            ..HubConfig::default()
        })
        .await;

        let node_key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let public_key = hex::encode(node_key.verifying_key().as_bytes());
        let node_id = AgentId::random();
        let certificate = fixture
            .credentials
            .issue_certificate(
                node_id,
                &public_key,
                CapabilitySet::new(),
                chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        let nonce = b"server-nonce".to_vec();
        let signature = {
            use ed25519_dalek::Signer;
            hex::encode(node_key.sign(&nonce).to_bytes())
        };

        let (transport, _rx) = transport();
        let connection_id = fixture.hub.open_session(transport);
        let state = fixture
            .hub
            .authenticate(
                connection_id,
                SessionAuth::Certificate {
                    certificate,
                    nonce,
                    signature,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            state,
            SessionState::Authenticated {
                agent_id: Some(node_id)
            }
        );

        // A register under a different id is refused.
        let err = fixture
            .hub
            .handle_message(
                connection_id,
                AgentMessage::Register {
                    descriptor: descriptor("cpu"),
                },
            )
            .await
            .expect_err("identity mismatch");
        assert!(matches!(err, HubError::NotPermitted { .. }));
    }
}
