//! Composition root wiring every orchestration component.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mesh_config::{ConfigError, ServerConfig};
use mesh_credentials::{
    CredentialService, InMemoryBootstrapTokenStore, InMemoryCertificateStore,
    InMemoryRevocationStore, IssuedToken,
};
use mesh_dispatch::{Dispatcher, DispatcherConfig, Resilience, RetryPolicy};
use mesh_enroll::{EnrollmentService, EnrollmentStatus, InMemoryEnrollmentStore};
use mesh_hub::{Hub, HubConfig, StreamRelay};
use mesh_jobs::{
    EventLog, InMemoryDeadLetter, InMemoryEventLog, InMemoryJobStore, JobDefaults, JobEventKind,
    JobService, JobsResult,
};
use mesh_primitives::{
    CapabilitySet, Classify, EnrollmentId, ErrorKind, JobId, JobRequest, SubmitReceipt,
};
use mesh_registry::{
    AgentRegistry, HeartbeatMonitor, InMemoryAgentStore, MonitorConfig, PresenceEvent,
};

use crate::bus::{EnrollmentDecided, EventBus};

/// Result alias for server assembly and administration.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised by the composition root.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration failed validation; startup is refused.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A job operation failed.
    #[error(transparent)]
    Job(#[from] mesh_jobs::JobError),

    /// An enrollment operation failed.
    #[error(transparent)]
    Enroll(#[from] mesh_enroll::EnrollError),

    /// A credential operation failed.
    #[error(transparent)]
    Credential(#[from] mesh_credentials::CredentialError),

    /// A hub operation failed.
    #[error(transparent)]
    Hub(#[from] mesh_hub::HubError),
}

impl Classify for ServerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(err) => err.kind(),
            Self::Job(err) => err.kind(),
            Self::Enroll(err) => err.kind(),
            Self::Credential(err) => err.kind(),
            Self::Hub(err) => err.kind(),
        }
    }
}

// Event-log decorator that mirrors every append onto the bus. The append
// happens on the job's FSM task, so subscribers observe transitions in
// per-job order.
struct PublishingEventLog {
    inner: Arc<dyn EventLog>,
    bus: Arc<EventBus>,
}

#[async_trait]
impl EventLog for PublishingEventLog {
    async fn append(&self, job_id: JobId, kind: JobEventKind) -> JobsResult<u64> {
        let position = self.inner.append(job_id, kind).await?;
        if let Ok(events) = self.inner.from_position(position).await {
            if let Some(event) = events.first() {
                self.bus.publish_job_event(event);
            }
        }
        Ok(position)
    }

    async fn for_job(&self, job_id: JobId) -> JobsResult<Vec<mesh_jobs::JobEvent>> {
        self.inner.for_job(job_id).await
    }

    async fn from_position(&self, position: u64) -> JobsResult<Vec<mesh_jobs::JobEvent>> {
        self.inner.from_position(position).await
    }
}

/// The assembled mesh server.
///
/// Construction validates configuration and builds every component over
/// in-memory stores; [`Orchestrator::start`] brings up the background
/// tasks (heartbeat monitor, dispatch loop, enrollment expiry sweep) and
/// replays persisted state.
pub struct Orchestrator {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    jobs: Arc<JobService>,
    dispatcher: Arc<Dispatcher>,
    credentials: Arc<CredentialService>,
    enrollment: Arc<EnrollmentService>,
    hub: Arc<Hub>,
    bus: Arc<EventBus>,
    monitor: Mutex<HeartbeatMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Builds a server over in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] when the configuration is invalid;
    /// the process must not come up in that case.
    pub async fn in_memory(config: ServerConfig) -> ServerResult<Arc<Self>> {
        config.validate()?;

        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(AgentRegistry::new(Arc::new(InMemoryAgentStore::default())));

        let event_log: Arc<dyn EventLog> = Arc::new(PublishingEventLog {
            inner: Arc::new(InMemoryEventLog::default()),
            bus: Arc::clone(&bus),
        });
        let jobs = Arc::new(JobService::new(
            Arc::new(InMemoryJobStore::new()),
            event_log,
            Arc::new(InMemoryDeadLetter::default()),
            JobDefaults {
                timeout: config.default_job_timeout,
                max_retries: config.max_retry_attempts,
            },
        ));

        let dispatcher = Dispatcher::new(
            Arc::clone(&jobs),
            Arc::clone(&registry),
            DispatcherConfig {
                per_agent_queue: config.per_agent_queue,
                ack_timeout: config.ack_timeout,
                tick_interval: config.dispatch_tick_interval,
                retry: RetryPolicy::new(config.retry_base_delay, config.retry_max_delay),
            },
        );

        let credentials = Arc::new(CredentialService::new(
            Arc::new(InMemoryCertificateStore::default()),
            Arc::new(InMemoryRevocationStore::default()),
            Arc::new(InMemoryBootstrapTokenStore::default()),
        ));
        credentials.initialize_server_keys().await;

        let enrollment = Arc::new(EnrollmentService::new(
            Arc::new(InMemoryEnrollmentStore::default()),
            Arc::clone(&credentials),
            chrono::Duration::from_std(config.certificate_validity)
                .unwrap_or_else(|_| chrono::Duration::days(30)),
            chrono::Duration::from_std(config.enrollment_ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        ));

        let hub = Arc::new(Hub::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&jobs),
            Arc::clone(&credentials),
            Arc::clone(&enrollment),
            Arc::new(StreamRelay::new()),
            Arc::new(Resilience::default()),
            HubConfig {
                require_certificate_auth: config.require_certificate_auth,
                allow_anonymous: config.allow_anonymous,
                api_token: config.legacy_api_token.clone(),
            },
        ));

        let monitor = Mutex::new(HeartbeatMonitor::new(
            Arc::clone(&registry),
            MonitorConfig {
                heartbeat_timeout: config.heartbeat_timeout,
            },
        ));

        Ok(Arc::new(Self {
            config,
            registry,
            jobs,
            dispatcher,
            credentials,
            enrollment,
            hub,
            bus,
            monitor,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Starts background tasks and replays persisted state.
    ///
    /// # Errors
    ///
    /// Propagates store failures from crash recovery.
    pub async fn start(self: &Arc<Self>) -> ServerResult<()> {
        // Crash recovery first: in-flight jobs go back to the queue before
        // the dispatch loop starts assigning.
        let recovered = self.jobs.recover().await?;
        if recovered > 0 {
            info!(recovered, "recovered in-flight jobs");
        }

        let disconnects = self.monitor.lock().await.start();
        let dispatch_loop = self.dispatcher.start(disconnects).await;

        // Mirror presence changes onto the bus.
        let mut presence = self.registry.subscribe();
        let bus = Arc::clone(&self.bus);
        let presence_task = tokio::spawn(async move {
            while let Ok(event) = presence.recv().await {
                match event {
                    PresenceEvent::Registered(agent_id) => bus.publish_agent_connected(agent_id),
                    PresenceEvent::Disconnected(agent_id)
                    | PresenceEvent::Unregistered(agent_id) => {
                        bus.publish_agent_disconnected(agent_id);
                    }
                }
            }
        });

        // Periodic expiry of stale pending enrollments.
        let enrollment = Arc::clone(&self.enrollment);
        let sweep_every = (self.config.enrollment_ttl / 4).max(Duration::from_secs(1));
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                if let Err(err) = enrollment.expire_overdue().await {
                    warn!(?err, "enrollment expiry sweep failed");
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(dispatch_loop);
        tasks.push(presence_task);
        tasks.push(sweep_task);
        info!("mesh server started");
        Ok(())
    }

    /// Stops background tasks.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.monitor.lock().await.stop();
        self.dispatcher.shutdown();
        info!("mesh server stopped");
    }

    /// Submits a job and nudges the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`mesh_jobs::JobError::InvalidRequest`] for a malformed
    /// request.
    pub async fn submit_job(&self, request: JobRequest) -> ServerResult<SubmitReceipt> {
        let receipt = self.jobs.submit(request).await?;
        self.dispatcher.kick();
        Ok(receipt)
    }

    /// Cancels a job, propagating to the owning agent when in flight.
    ///
    /// # Errors
    ///
    /// Returns [`mesh_jobs::JobError::UnknownJob`] for a missing job.
    pub async fn cancel_job(
        &self,
        job_id: JobId,
        reason: impl Into<String>,
    ) -> ServerResult<bool> {
        Ok(self.hub.cancel_job(job_id, reason).await?)
    }

    /// Approves a pending enrollment, optionally narrowing the granted
    /// capability set.
    ///
    /// # Errors
    ///
    /// Propagates enrollment failures.
    pub async fn approve_enrollment(
        &self,
        enrollment_id: EnrollmentId,
        granted: Option<CapabilitySet>,
    ) -> ServerResult<mesh_credentials::Certificate> {
        let certificate = self.enrollment.approve(enrollment_id, granted).await?;
        self.bus.publish_enrollment_decided(EnrollmentDecided {
            enrollment_id,
            status: EnrollmentStatus::Approved,
        });
        Ok(certificate)
    }

    /// Rejects a pending enrollment, optionally blocking the node.
    ///
    /// # Errors
    ///
    /// Propagates enrollment failures.
    pub async fn reject_enrollment(
        &self,
        enrollment_id: EnrollmentId,
        block_future: bool,
    ) -> ServerResult<()> {
        self.enrollment.reject(enrollment_id, block_future).await?;
        self.bus.publish_enrollment_decided(EnrollmentDecided {
            enrollment_id,
            status: EnrollmentStatus::Rejected,
        });
        Ok(())
    }

    /// Regenerates the bootstrap token, honoring the configured
    /// auto-approve policy.
    ///
    /// # Errors
    ///
    /// Propagates credential-store failures.
    pub async fn regenerate_bootstrap_token(&self) -> ServerResult<IssuedToken> {
        Ok(self
            .credentials
            .regenerate_bootstrap_token(self.config.bootstrap_auto_approve)
            .await?)
    }

    /// Returns the effective configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the job engine.
    #[must_use]
    pub fn jobs(&self) -> &Arc<JobService> {
        &self.jobs
    }

    /// Returns the presence registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Returns the hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Returns the credential authority.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialService> {
        &self.credentials
    }

    /// Returns the enrollment service.
    #[must_use]
    pub fn enrollment(&self) -> &Arc<EnrollmentService> {
        &self.enrollment
    }

    /// Returns the event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}
