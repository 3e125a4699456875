//! End-to-end scenarios driving the server through in-process sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use mesh_server::config::ServerConfig;
use mesh_server::hub::{
    AgentMessage, HubError, HubResult, ServerMessage, SessionAuth, SessionTransport,
};
use mesh_server::jobs::JobEventKind;
use mesh_server::primitives::{
    AgentDescriptor, AgentId, Capability, CapabilityId, CapabilitySet, ConnectionId, Job, JobId,
    JobRequest, JobResult, JobStatus, StreamItem,
};
use mesh_server::{Orchestrator, ServerError};

struct ChannelTransport {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn send(&self, message: ServerMessage) -> HubResult<()> {
        self.tx.send(message).map_err(|_| HubError::TransportClosed {
            reason: "receiver dropped".into(),
        })
    }

    async fn close(&self) -> HubResult<()> {
        Ok(())
    }
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        heartbeat_timeout: Duration::from_secs(60),
        ack_timeout: Duration::from_millis(250),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        dispatch_tick_interval: Duration::from_millis(20),
        default_job_timeout: Duration::from_secs(5),
        allow_anonymous: true,
        ..ServerConfig::default()
    }
}

async fn server(config: ServerConfig) -> Arc<Orchestrator> {
    let orchestrator = Orchestrator::in_memory(config).await.expect("valid config");
    orchestrator.start().await.expect("startup");
    orchestrator
}

struct TestAgent {
    orchestrator: Arc<Orchestrator>,
    connection_id: ConnectionId,
    agent_id: AgentId,
    rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl TestAgent {
    async fn connect(orchestrator: &Arc<Orchestrator>, capabilities: &[&str]) -> Self {
        let descriptor = descriptor(capabilities);
        Self::connect_as(orchestrator, descriptor).await
    }

    async fn connect_as(orchestrator: &Arc<Orchestrator>, descriptor: AgentDescriptor) -> Self {
        let agent_id = descriptor.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = orchestrator
            .hub()
            .open_session(Arc::new(ChannelTransport { tx }));
        orchestrator
            .hub()
            .authenticate(connection_id, SessionAuth::Anonymous)
            .await
            .expect("authenticate");
        orchestrator
            .hub()
            .handle_message(connection_id, AgentMessage::Register { descriptor })
            .await
            .expect("register");
        Self {
            orchestrator: Arc::clone(orchestrator),
            connection_id,
            agent_id,
            rx,
        }
    }

    async fn expect_assignment(&mut self) -> Job {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("assignment within deadline")
                .expect("transport open");
            if let ServerMessage::AssignJob(job) = message {
                return job;
            }
        }
    }

    async fn expect_cancel(&mut self) -> JobId {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
                .await
                .expect("cancel within deadline")
                .expect("transport open");
            if let ServerMessage::CancelJob { job_id, .. } = message {
                return job_id;
            }
        }
    }

    async fn send(&self, message: AgentMessage) {
        self.orchestrator
            .hub()
            .handle_message(self.connection_id, message)
            .await
            .expect("message accepted");
    }

    async fn ack(&self, job_id: JobId) {
        self.send(AgentMessage::AckJob { job_id }).await;
    }

    async fn complete(&self, job_id: JobId, payload: &[u8]) {
        self.send(AgentMessage::ReportResult(JobResult::success(
            job_id,
            Bytes::copy_from_slice(payload),
        )))
        .await;
    }

    async fn fail(&self, job_id: JobId) {
        self.send(AgentMessage::ReportResult(JobResult::failure(
            job_id,
            "handler always fails",
            "E_EXEC",
        )))
        .await;
    }

    async fn disconnect(self) {
        self.orchestrator.hub().close_session(self.connection_id).await;
    }
}

fn descriptor(capabilities: &[&str]) -> AgentDescriptor {
    let capabilities = capabilities
        .iter()
        .map(|name| Capability::new(CapabilityId::new(*name).unwrap(), "1.0").unwrap())
        .collect();
    AgentDescriptor::builder(AgentId::random())
        .name("test-agent")
        .unwrap()
        .version("0.1.0")
        .unwrap()
        .capabilities(capabilities)
        .build()
        .unwrap()
}

fn request(command: &str, capabilities: &[&str]) -> JobRequest {
    let mut request = JobRequest::new(command);
    request.required_capabilities = capabilities
        .iter()
        .map(|name| CapabilityId::new(*name).unwrap())
        .collect::<CapabilitySet>();
    request
}

async fn wait_for_status(
    orchestrator: &Arc<Orchestrator>,
    job_id: JobId,
    status: JobStatus,
) -> Job {
    for _ in 0..100 {
        let job = orchestrator.jobs().get(job_id).await.expect("job exists");
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached {status:?}");
}

// S1: repeated keyed submissions collapse to one job that completes once.
#[tokio::test]
async fn idempotent_submission_completes_once() {
    let orchestrator = server(fast_config()).await;
    let mut agent = TestAgent::connect(&orchestrator, &[]).await;

    let mut echo = request("echo", &[]);
    echo.idempotency_key = Some("K1".into());
    echo.parameters = Bytes::from_static(b"hello");

    let first = orchestrator.submit_job(echo.clone()).await.unwrap();
    assert!(first.is_created());

    for _ in 0..5 {
        let repeat = orchestrator.submit_job(echo.clone()).await.unwrap();
        assert!(!repeat.is_created());
        assert_eq!(repeat.job_id(), first.job_id());
    }

    let assigned = agent.expect_assignment().await;
    assert_eq!(assigned.id, first.job_id());
    agent.ack(assigned.id).await;
    agent.complete(assigned.id, b"hello").await;

    let job = wait_for_status(&orchestrator, first.job_id(), JobStatus::Completed).await;
    assert_eq!(job.result, Some(Bytes::from_static(b"hello")));

    // Resubmitting after completion still returns the terminal record.
    let after = orchestrator.submit_job(echo).await.unwrap();
    assert_eq!(after.job_id(), first.job_id());

    orchestrator.shutdown().await;
}

// S2: capability matching; an unmatched job stays pending indefinitely.
#[tokio::test]
async fn capability_matching_gates_dispatch() {
    let orchestrator = server(fast_config()).await;
    let mut agent = TestAgent::connect(&orchestrator, &["gpu"]).await;

    let gpu_job = orchestrator
        .submit_job(request("render", &["gpu"]))
        .await
        .unwrap()
        .job_id();
    let cpu_job = orchestrator
        .submit_job(request("transcode", &["cpu"]))
        .await
        .unwrap()
        .job_id();

    let assigned = agent.expect_assignment().await;
    assert_eq!(assigned.id, gpu_job);
    // Capability invariant: the assignee advertises every required name.
    assert_eq!(assigned.assigned_agent_id, Some(agent.agent_id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stuck = orchestrator.jobs().get(cpu_job).await.unwrap();
    assert_eq!(stuck.status, JobStatus::Pending);
    assert!(stuck.assigned_agent_id.is_none());

    orchestrator.shutdown().await;
}

// S3: disconnect mid-run; a second agent finishes and the event log shows
// the full assign/start/reject/assign/start/complete history.
#[tokio::test]
async fn disconnect_mid_run_reassigns() {
    let orchestrator = server(fast_config()).await;
    let mut first = TestAgent::connect(&orchestrator, &["gpu"]).await;

    let job_id = orchestrator
        .submit_job(request("render", &["gpu"]))
        .await
        .unwrap()
        .job_id();

    let assigned = first.expect_assignment().await;
    first.ack(assigned.id).await;
    wait_for_status(&orchestrator, job_id, JobStatus::Running).await;
    first.disconnect().await;

    let job = wait_for_status(&orchestrator, job_id, JobStatus::Pending).await;
    assert_eq!(job.attempt_count, 1);
    assert!(job.assigned_agent_id.is_none());

    let mut second = TestAgent::connect(&orchestrator, &["gpu"]).await;
    let reassigned = second.expect_assignment().await;
    assert_eq!(reassigned.id, job_id);
    second.ack(job_id).await;
    second.complete(job_id, b"done").await;
    wait_for_status(&orchestrator, job_id, JobStatus::Completed).await;

    let kinds: Vec<&'static str> = orchestrator
        .jobs()
        .events(job_id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| match event.kind {
            JobEventKind::Submitted => "submitted",
            JobEventKind::Assigned { .. } => "assigned",
            JobEventKind::Started => "started",
            JobEventKind::Rejected { .. } => "rejected",
            JobEventKind::Completed => "completed",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "submitted",
            "assigned",
            "started",
            "rejected",
            "assigned",
            "started",
            "completed",
        ]
    );

    orchestrator.shutdown().await;
}

// S4: a permanently failing handler exhausts its retry budget and lands in
// dead-letter after exactly three execution attempts.
#[tokio::test]
async fn exhausted_retries_reach_dead_letter() {
    let orchestrator = server(fast_config()).await;
    let mut agent = TestAgent::connect(&orchestrator, &[]).await;

    let mut failing = request("explode", &[]);
    failing.max_retries = Some(2);
    let job_id = orchestrator.submit_job(failing).await.unwrap().job_id();

    for _ in 0..3 {
        let assigned = agent.expect_assignment().await;
        assert_eq!(assigned.id, job_id);
        agent.ack(job_id).await;
        agent.fail(job_id).await;
    }

    let job = wait_for_status(&orchestrator, job_id, JobStatus::Failed).await;
    assert_eq!(job.attempt_count, 3);
    assert!(job.is_terminal());

    let dead = orchestrator.jobs().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.id, job_id);

    orchestrator.shutdown().await;
}

// S6: ordered stream delivery with replay for a late subscriber.
#[tokio::test]
async fn stream_subscribers_observe_ordered_prefix() {
    let orchestrator = server(fast_config()).await;
    let agent = TestAgent::connect(&orchestrator, &[]).await;
    let job_id = JobId::random();

    let early = orchestrator.hub().streams().subscribe(job_id);
    assert!(early.replay.is_empty());

    for sequence in 0..50u64 {
        agent
            .send(AgentMessage::ReportStream(StreamItem {
                job_id,
                sequence,
                payload: Bytes::from(sequence.to_string()),
                is_end: false,
            }))
            .await;
    }

    // The late subscriber replays the persisted head, then tails live.
    let late = orchestrator.hub().streams().subscribe(job_id);
    assert_eq!(late.replay.len(), 50);

    for sequence in 50..100u64 {
        agent
            .send(AgentMessage::ReportStream(StreamItem {
                job_id,
                sequence,
                payload: Bytes::from(sequence.to_string()),
                is_end: sequence == 99,
            }))
            .await;
    }

    let mut early_seen = Vec::new();
    let mut live = early.live;
    while early_seen.last().map(|i: &StreamItem| i.is_end) != Some(true) {
        early_seen.push(live.recv().await.expect("live item"));
    }
    let sequences: Vec<u64> = early_seen.iter().map(|i| i.sequence).collect();
    assert_eq!(sequences, (0..100).collect::<Vec<_>>());
    assert_eq!(early_seen.iter().filter(|i| i.is_end).count(), 1);

    let mut late_seen: Vec<u64> = late.replay.iter().map(|i| i.sequence).collect();
    let mut live = late.live;
    while late_seen.len() < 100 {
        late_seen.push(live.recv().await.expect("live item").sequence);
    }
    assert_eq!(late_seen, (0..100).collect::<Vec<_>>());

    orchestrator.shutdown().await;
}

// Heartbeat-driven reassignment: a silent agent loses its in-flight job to
// the queue within one dispatcher tick of the timeout.
#[tokio::test]
async fn heartbeat_loss_requeues_in_flight_work() {
    let config = ServerConfig {
        heartbeat_timeout: Duration::from_millis(150),
        ..fast_config()
    };
    let orchestrator = server(config).await;
    let mut agent = TestAgent::connect(&orchestrator, &[]).await;

    let job_id = orchestrator
        .submit_job(request("long-run", &[]))
        .await
        .unwrap()
        .job_id();
    let assigned = agent.expect_assignment().await;
    agent.ack(assigned.id).await;
    wait_for_status(&orchestrator, job_id, JobStatus::Running).await;

    // The agent never heartbeats again; the monitor reclaims its work.
    let job = wait_for_status(&orchestrator, job_id, JobStatus::Pending).await;
    assert!(job.assigned_agent_id.is_none());

    orchestrator.shutdown().await;
}

// Cancellation propagates to the owning agent within its grace window.
#[tokio::test]
async fn cancellation_reaches_the_owning_agent() {
    let orchestrator = server(fast_config()).await;
    let mut agent = TestAgent::connect(&orchestrator, &[]).await;

    let job_id = orchestrator
        .submit_job(request("long-run", &[]))
        .await
        .unwrap()
        .job_id();
    let assigned = agent.expect_assignment().await;
    agent.ack(assigned.id).await;

    assert!(orchestrator.cancel_job(job_id, "operator").await.unwrap());
    assert_eq!(agent.expect_cancel().await, job_id);
    assert_eq!(
        orchestrator.jobs().get(job_id).await.unwrap().status,
        JobStatus::Cancelled
    );

    orchestrator.shutdown().await;
}

// Startup refuses invalid configuration outright.
#[tokio::test]
async fn invalid_configuration_refuses_startup() {
    let config = ServerConfig {
        per_agent_queue: 0,
        ..ServerConfig::default()
    };
    let err = Orchestrator::in_memory(config).await.expect_err("must refuse");
    assert!(matches!(err, ServerError::Config(_)));
}
