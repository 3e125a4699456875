//! Agent selection and job routing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use mesh_jobs::{JobService, JobTrigger, JobsResult};
use mesh_primitives::{AgentId, AgentStatus, Job, JobId, JobResult, JobStatus};
use mesh_registry::AgentRegistry;

use crate::retry::RetryPolicy;
use crate::timers::{TimerKey, TimerWheel};

/// Tunables for the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Capacity of each per-agent send channel.
    pub per_agent_queue: usize,
    /// Time allowed between `Assign` and the agent's acknowledgement.
    pub ack_timeout: Duration,
    /// Fallback interval between dispatch passes.
    pub tick_interval: Duration,
    /// Backoff policy for failed and timed-out jobs.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            per_agent_queue: 16,
            ack_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(250),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
struct AgentLane {
    tx: mpsc::Sender<Job>,
    outstanding: usize,
    last_assigned: Option<Instant>,
}

/// Routes pending jobs to eligible agents.
///
/// Each connected agent has one bounded lane with a single consumer (its
/// hub session), so outbound messages to one agent are serialized. When a
/// lane is full the job simply stays `Pending`; submitters never block on
/// backpressure.
pub struct Dispatcher {
    jobs: Arc<JobService>,
    registry: Arc<AgentRegistry>,
    config: DispatcherConfig,
    lanes: DashMap<AgentId, AgentLane>,
    timers: TimerWheel,
    timer_task: JoinHandle<()>,
    fired: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TimerKey>>>,
    kick: Notify,
}

impl Dispatcher {
    /// Creates a dispatcher over the job service and presence registry.
    #[must_use]
    pub fn new(
        jobs: Arc<JobService>,
        registry: Arc<AgentRegistry>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        let (timers, fired, timer_task) = TimerWheel::spawn();
        Arc::new(Self {
            jobs,
            registry,
            config,
            lanes: DashMap::new(),
            timers,
            timer_task,
            fired: tokio::sync::Mutex::new(Some(fired)),
            kick: Notify::new(),
        })
    }

    /// Starts the dispatch loop.
    ///
    /// `disconnects` is the heartbeat monitor's notification channel; each
    /// id received triggers reassignment of that agent's in-flight work.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the loop owns the timer receiver.
    pub async fn start(
        self: &Arc<Self>,
        mut disconnects: mpsc::UnboundedReceiver<AgentId>,
    ) -> JoinHandle<()> {
        let mut fired = self
            .fired
            .lock()
            .await
            .take()
            .expect("dispatcher started twice");
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(dispatcher.config.tick_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut disconnects_closed = false;

            loop {
                tokio::select! {
                    () = dispatcher.kick.notified() => {
                        dispatcher.dispatch_pass().await;
                    }
                    _ = tick.tick() => {
                        dispatcher.dispatch_pass().await;
                    }
                    key = fired.recv() => {
                        // The timer wheel outlives the loop; a closed
                        // channel means shutdown.
                        let Some(key) = key else { break };
                        dispatcher.handle_timer(key).await;
                    }
                    agent = disconnects.recv(), if !disconnects_closed => {
                        match agent {
                            Some(agent_id) => dispatcher.handle_disconnect(agent_id).await,
                            None => disconnects_closed = true,
                        }
                    }
                }
            }
            info!("dispatcher stopped");
        })
    }

    /// Attaches a newly connected agent, returning the receiver its hub
    /// session drains for outbound assignments.
    #[must_use]
    pub fn attach_agent(&self, agent_id: AgentId) -> mpsc::Receiver<Job> {
        let (tx, rx) = mpsc::channel(self.config.per_agent_queue);
        self.lanes.insert(
            agent_id,
            AgentLane {
                tx,
                outstanding: 0,
                last_assigned: None,
            },
        );
        self.kick.notify_one();
        rx
    }

    /// Detaches an agent's lane; queued but unsent assignments are dropped
    /// and their jobs recovered by the acknowledgement timers.
    pub fn detach_agent(&self, agent_id: AgentId) {
        self.lanes.remove(&agent_id);
    }

    /// Nudges the dispatch loop; called after submissions.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Handles an agent's acknowledgement of an assignment.
    ///
    /// Returns `true` when the job moved to `Running`. Starts the job's
    /// execution timer.
    ///
    /// # Errors
    ///
    /// Propagates job-store failures; an unknown job surfaces as an error
    /// for the hub to log.
    pub async fn on_ack(&self, job_id: JobId) -> JobsResult<bool> {
        let applied = self.jobs.apply(job_id, JobTrigger::Start).await?;
        if applied {
            self.timers.cancel(TimerKey::Ack(job_id));
            let job = self.jobs.get(job_id).await?;
            self.timers.schedule(TimerKey::Execution(job_id), job.timeout);
        }
        Ok(applied)
    }

    /// Handles an agent's refusal of an assignment.
    ///
    /// # Errors
    ///
    /// Propagates job-store failures.
    pub async fn on_nack(&self, job_id: JobId, reason: impl Into<String>) -> JobsResult<bool> {
        let previous = self.jobs.get(job_id).await?.assigned_agent_id;
        let applied = self
            .jobs
            .apply(
                job_id,
                JobTrigger::Reject {
                    reason: reason.into(),
                },
            )
            .await?;
        if applied {
            self.timers.cancel(TimerKey::Ack(job_id));
            if let Some(agent_id) = previous {
                self.release_slot(agent_id);
            }
            self.kick.notify_one();
        }
        Ok(applied)
    }

    /// Handles a terminal result reported by an agent.
    ///
    /// Idempotent per job: the first result drives the transition, repeats
    /// return `false`. A failure with budget left schedules a retry.
    ///
    /// # Errors
    ///
    /// Propagates job-store failures.
    pub async fn on_result(&self, result: JobResult) -> JobsResult<bool> {
        let job_id = result.job_id;
        let previous = self.jobs.get(job_id).await?.assigned_agent_id;

        let trigger = if result.success {
            JobTrigger::Complete(result)
        } else {
            JobTrigger::Fail {
                error: result.error.clone().unwrap_or_else(|| "job failed".into()),
                error_code: result.error_code.clone(),
            }
        };

        let applied = self.jobs.apply(job_id, trigger).await?;
        if applied {
            self.timers.cancel(TimerKey::Ack(job_id));
            self.timers.cancel(TimerKey::Execution(job_id));
            if let Some(agent_id) = previous {
                self.release_slot(agent_id);
            }
            self.maybe_schedule_retry(job_id).await?;
        }
        Ok(applied)
    }

    /// Reassigns every in-flight job of a disconnected agent.
    pub async fn handle_disconnect(&self, agent_id: AgentId) {
        self.detach_agent(agent_id);

        let in_flight = match self.jobs.list_by_agent(agent_id).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(agent_id = %agent_id, ?err, "failed to list jobs for disconnected agent");
                return;
            }
        };

        for job in in_flight {
            self.timers.cancel(TimerKey::Ack(job.id));
            self.timers.cancel(TimerKey::Execution(job.id));
            match self
                .jobs
                .apply(
                    job.id,
                    JobTrigger::Reject {
                        reason: "agent disconnected".into(),
                    },
                )
                .await
            {
                Ok(true) => {
                    debug!(job_id = %job.id, agent_id = %agent_id, "job returned to pending after disconnect");
                }
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.id, ?err, "disconnect reassignment failed"),
            }
        }
        self.kick.notify_one();
    }

    async fn handle_timer(&self, key: TimerKey) {
        let outcome = match key {
            TimerKey::Ack(job_id) => self.handle_ack_timeout(job_id).await,
            TimerKey::Execution(job_id) => self.handle_execution_timeout(job_id).await,
            TimerKey::Retry(job_id) => self.handle_retry_due(job_id).await,
        };
        if let Err(err) = outcome {
            warn!(?key, ?err, "timer handling failed");
        }
    }

    async fn handle_ack_timeout(&self, job_id: JobId) -> JobsResult<()> {
        let previous = self.jobs.get(job_id).await?.assigned_agent_id;
        if self.jobs.apply(job_id, JobTrigger::Timeout).await? {
            warn!(job_id = %job_id, "assignment not acknowledged in time");
            if let Some(agent_id) = previous {
                self.release_slot(agent_id);
            }
            self.kick.notify_one();
        }
        Ok(())
    }

    async fn handle_execution_timeout(&self, job_id: JobId) -> JobsResult<()> {
        let previous = self.jobs.get(job_id).await?.assigned_agent_id;
        if self.jobs.apply(job_id, JobTrigger::Timeout).await? {
            warn!(job_id = %job_id, "job execution timed out");
            if let Some(agent_id) = previous {
                self.release_slot(agent_id);
            }
            self.maybe_schedule_retry(job_id).await?;
        }
        Ok(())
    }

    async fn handle_retry_due(&self, job_id: JobId) -> JobsResult<()> {
        if self.jobs.apply(job_id, JobTrigger::Retry).await? {
            self.kick.notify_one();
        }
        Ok(())
    }

    async fn maybe_schedule_retry(&self, job_id: JobId) -> JobsResult<()> {
        let job = self.jobs.get(job_id).await?;
        if !job.can_retry() {
            return Ok(());
        }
        let delay = self.config.retry.delay_for(job.attempt_count);
        self.jobs.note_retry_scheduled(job_id, delay).await?;
        self.timers.schedule(TimerKey::Retry(job_id), delay);
        debug!(job_id = %job_id, ?delay, attempt = job.attempt_count, "retry scheduled");
        Ok(())
    }

    /// One pass over the pending queue.
    async fn dispatch_pass(&self) {
        let mut pending = match self.jobs.list_by_status(JobStatus::Pending).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(?err, "failed to list pending jobs");
                return;
            }
        };

        // Highest priority first, FIFO inside a priority band.
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        for job in pending {
            if job.attempt_count > job.max_retries {
                // The assignment budget is gone (acknowledgements never
                // arrived); close the job out instead of spinning.
                if let Err(err) = self.jobs.apply(job.id, JobTrigger::Timeout).await {
                    warn!(job_id = %job.id, ?err, "failed to time out exhausted job");
                }
                continue;
            }

            if let Err(err) = self.try_assign(&job).await {
                warn!(job_id = %job.id, ?err, "assignment attempt failed");
            }
        }
    }

    async fn try_assign(&self, job: &Job) -> JobsResult<()> {
        let Some(agent_id) = self.select_agent(job) else {
            return Ok(());
        };

        // Reserve the lane slot before touching the state machine so a full
        // queue leaves the job untouched.
        let permit = {
            let Some(lane) = self.lanes.get(&agent_id) else {
                return Ok(());
            };
            match lane.tx.clone().try_reserve_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(agent_id = %agent_id, job_id = %job.id, "agent lane full; job stays pending");
                    return Ok(());
                }
            }
        };

        if !self.jobs.apply(job.id, JobTrigger::Assign(agent_id)).await? {
            // The job changed under us (cancelled or already assigned).
            drop(permit);
            return Ok(());
        }

        let assigned = self.jobs.get(job.id).await?;
        permit.send(assigned);
        self.timers
            .schedule(TimerKey::Ack(job.id), self.config.ack_timeout);

        if let Some(mut lane) = self.lanes.get_mut(&agent_id) {
            lane.outstanding += 1;
            lane.last_assigned = Some(Instant::now());
        }
        debug!(job_id = %job.id, agent_id = %agent_id, "job dispatched");
        Ok(())
    }

    /// Applies the selection order: pinned target first, then capability
    /// and status filtering, then least-loaded with earliest-assignment
    /// tie-break.
    fn select_agent(&self, job: &Job) -> Option<AgentId> {
        if let Some(target) = job.target_agent_id {
            let snapshot = self.registry.get(target)?;
            if snapshot.status == AgentStatus::Ready && self.lanes.contains_key(&target) {
                return Some(target);
            }
            return None;
        }

        let mut best: Option<(AgentId, usize, Option<Instant>)> = None;
        for snapshot in self.registry.all() {
            if !snapshot.status.is_dispatchable() {
                continue;
            }
            if !snapshot
                .descriptor
                .capability_set()
                .satisfies(&job.required_capabilities)
            {
                continue;
            }
            let agent_id = snapshot.descriptor.id();
            let Some(lane) = self.lanes.get(&agent_id) else {
                continue;
            };

            let candidate = (agent_id, lane.outstanding, lane.last_assigned);
            let better = match &best {
                None => true,
                Some((_, outstanding, last_assigned)) => {
                    candidate.1 < *outstanding
                        || (candidate.1 == *outstanding
                            && earlier(candidate.2, *last_assigned))
                }
            };
            if better {
                best = Some(candidate);
            }
        }
        best.map(|(agent_id, _, _)| agent_id)
    }

    fn release_slot(&self, agent_id: AgentId) {
        if let Some(mut lane) = self.lanes.get_mut(&agent_id) {
            lane.outstanding = lane.outstanding.saturating_sub(1);
        }
        self.kick.notify_one();
    }

    /// Stops the timer task; the dispatch loop exits with its channels.
    pub fn shutdown(&self) {
        self.timer_task.abort();
    }
}

// `None` sorts earliest: an agent that never received work wins ties.
fn earlier(a: Option<Instant>, b: Option<Instant>) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b,
    }
}
