//! The job service: submission, serialized transitions, and recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use mesh_primitives::{
    AgentId, Job, JobId, JobProgress, JobRequest, JobStatus, SubmitReceipt,
};

use crate::dead_letter::DeadLetterSink;
use crate::error::{JobError, JobResultExt, JobsResult};
use crate::events::{EventLog, JobEventKind};
use crate::fsm::{JobTrigger, next_status};
use crate::store::{InsertOutcome, JobStore};

/// Server-wide defaults applied to submissions that omit a value.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    /// Execution timeout when the request does not specify one.
    pub timeout: Duration,
    /// Retry budget when the request does not specify one.
    pub max_retries: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

/// Outcome of a cancellation attempt.
#[derive(Debug, Clone, Copy)]
pub struct CancelOutcome {
    /// `true` when the cancel transition was applied.
    pub cancelled: bool,
    /// Agent that must be told to stop, when the job was in flight.
    pub notify_agent: Option<AgentId>,
}

/// Coordinates the job store, state machine, and event log.
///
/// All transitions for one job are serialized through a per-job mutex, so
/// the state machine only ever sees one trigger at a time. Queries read
/// whatever consistent snapshot the store returns.
pub struct JobService {
    store: Arc<dyn JobStore>,
    log: Arc<dyn EventLog>,
    dead_letter: Arc<dyn DeadLetterSink>,
    defaults: JobDefaults,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl JobService {
    /// Creates a service over the supplied backends.
    #[must_use]
    pub fn new(
        store: Arc<dyn JobStore>,
        log: Arc<dyn EventLog>,
        dead_letter: Arc<dyn DeadLetterSink>,
        defaults: JobDefaults,
    ) -> Self {
        Self {
            store,
            log,
            dead_letter,
            defaults,
            locks: DashMap::new(),
        }
    }

    /// Submits a job request.
    ///
    /// A request carrying an idempotency key already bound to a job returns
    /// that job's id without creating anything; the caller can distinguish
    /// the cases through the receipt.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidRequest`] for an empty command, or
    /// propagates store failures.
    pub async fn submit(&self, request: JobRequest) -> JobsResult<SubmitReceipt> {
        if request.command.trim().is_empty() {
            return Err(JobError::InvalidRequest {
                reason: "command cannot be empty".into(),
            });
        }

        let job = Job {
            id: JobId::random(),
            idempotency_key: request.idempotency_key,
            command: request.command,
            parameters: request.parameters,
            priority: request.priority,
            timeout: request.timeout.unwrap_or(self.defaults.timeout),
            max_retries: request.max_retries.unwrap_or(self.defaults.max_retries),
            target_agent_id: request.target_agent_id,
            required_capabilities: request.required_capabilities,
            correlation_id: request.correlation_id,
            metadata: request.metadata,
            status: JobStatus::Pending,
            assigned_agent_id: None,
            attempt_count: 0,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            last_progress: None,
            result: None,
            error: None,
            error_code: None,
        };
        let job_id = job.id;

        match self.store.insert_or_fetch(job).await? {
            InsertOutcome::Inserted => {
                self.log.append(job_id, JobEventKind::Submitted).await?;
                info!(job_id = %job_id, "job submitted");
                Ok(SubmitReceipt::Created(job_id))
            }
            InsertOutcome::Existing(existing) => {
                debug!(job_id = %existing.id, "submission collapsed onto existing job");
                Ok(SubmitReceipt::Existing(existing.id))
            }
        }
    }

    /// Applies a trigger to a job's state machine.
    ///
    /// Returns `true` when the transition was applied. An illegal trigger is
    /// a logged no-op returning `false`; the state machine never raises on
    /// an out-of-table pair.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] for a missing record, or propagates
    /// store failures (in which case no state was changed).
    pub async fn apply(&self, job_id: JobId, trigger: JobTrigger) -> JobsResult<bool> {
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = self.store.get(job_id).await?.or_unknown(job_id)?;

        let Some(next) = next_status(job.status, &trigger, job.attempt_count, job.max_retries)
        else {
            warn!(
                job_id = %job_id,
                status = ?job.status,
                trigger = trigger.name(),
                "ignoring illegal job transition"
            );
            return Ok(false);
        };

        let previous = job.status;
        let event = Self::apply_effects(&mut job, &trigger, next);
        job.status = next;

        self.store.update(job.clone()).await?;
        self.log.append(job_id, event).await?;
        debug!(job_id = %job_id, from = ?previous, to = ?next, trigger = trigger.name(), "job transition");

        if matches!(next, JobStatus::Failed | JobStatus::TimedOut) && job.is_terminal() {
            let reason = job
                .error
                .clone()
                .unwrap_or_else(|| "retries exhausted".into());
            self.dead_letter.record(job.clone(), reason).await?;
            self.log.append(job_id, JobEventKind::DeadLettered).await?;
            info!(job_id = %job_id, attempts = job.attempt_count, "job dead-lettered");
        }

        Ok(true)
    }

    // Field updates for a transition that the table already approved.
    fn apply_effects(job: &mut Job, trigger: &JobTrigger, next: JobStatus) -> JobEventKind {
        let now = Utc::now();
        match trigger {
            JobTrigger::Assign(agent_id) => {
                job.assigned_agent_id = Some(*agent_id);
                job.assigned_at = Some(now);
                job.attempt_count += 1;
                JobEventKind::Assigned {
                    agent_id: *agent_id,
                }
            }
            JobTrigger::Start => {
                job.started_at = Some(now);
                JobEventKind::Started
            }
            JobTrigger::Reject { reason } => {
                job.assigned_agent_id = None;
                JobEventKind::Rejected {
                    reason: reason.clone(),
                }
            }
            JobTrigger::Cancel { reason } => {
                job.assigned_agent_id = None;
                job.completed_at = Some(now);
                job.error = Some(reason.clone());
                job.error_code = Some("cancelled".into());
                JobEventKind::Cancelled {
                    reason: reason.clone(),
                }
            }
            JobTrigger::Complete(result) => {
                job.assigned_agent_id = None;
                job.completed_at = Some(now);
                job.result = Some(result.payload.clone());
                JobEventKind::Completed
            }
            JobTrigger::Fail { error, error_code } => {
                job.assigned_agent_id = None;
                job.error = Some(error.clone());
                job.error_code = error_code.clone();
                if job.attempt_count > job.max_retries {
                    job.completed_at = Some(now);
                }
                JobEventKind::Failed {
                    error: error.clone(),
                }
            }
            JobTrigger::Timeout => {
                job.assigned_agent_id = None;
                if next == JobStatus::Pending {
                    // Acknowledgement never arrived; the round is treated as
                    // a NACK and the job goes back on the queue.
                    JobEventKind::Rejected {
                        reason: "acknowledgement timeout".into(),
                    }
                } else {
                    job.error = Some("execution timed out".into());
                    job.error_code = Some("timeout".into());
                    if job.attempt_count > job.max_retries {
                        job.completed_at = Some(now);
                    }
                    JobEventKind::TimedOut
                }
            }
            JobTrigger::Retry => JobEventKind::Retried,
        }
    }

    /// Attempts to cancel a job.
    ///
    /// When the job is in flight the returned outcome names the agent the
    /// hub must propagate the cancellation to.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] for a missing record.
    pub async fn cancel(
        &self,
        job_id: JobId,
        reason: impl Into<String>,
    ) -> JobsResult<CancelOutcome> {
        let assigned = self.store.get(job_id).await?.or_unknown(job_id)?.assigned_agent_id;

        let cancelled = self
            .apply(
                job_id,
                JobTrigger::Cancel {
                    reason: reason.into(),
                },
            )
            .await?;

        Ok(CancelOutcome {
            cancelled,
            notify_agent: if cancelled { assigned } else { None },
        })
    }

    /// Records a progress report for a running job.
    ///
    /// Reports arriving after a terminal status are dropped with a warning;
    /// the retained snapshot is frozen once a result is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] for a missing record.
    pub async fn set_progress(&self, progress: JobProgress) -> JobsResult<bool> {
        let job_id = progress.job_id;
        let lock = self.job_lock(job_id);
        let _guard = lock.lock().await;

        let mut job = self.store.get(job_id).await?.or_unknown(job_id)?;

        if job.is_terminal() {
            warn!(job_id = %job_id, "dropping progress report for terminal job");
            return Ok(false);
        }

        job.last_progress = Some(progress);
        self.store.update(job).await?;
        Ok(true)
    }

    /// Returns the record for a job.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] for a missing record.
    pub async fn get(&self, job_id: JobId) -> JobsResult<Job> {
        self.store.get(job_id).await?.or_unknown(job_id)
    }

    /// Lists jobs with the given status.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_by_status(&self, status: JobStatus) -> JobsResult<Vec<Job>> {
        self.store.list_by_status(status).await
    }

    /// Lists jobs currently assigned to an agent.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_by_agent(&self, agent_id: AgentId) -> JobsResult<Vec<Job>> {
        self.store.list_by_agent(agent_id).await
    }

    /// Returns the event history of a job in order.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn events(&self, job_id: JobId) -> JobsResult<Vec<crate::events::JobEvent>> {
        self.log.for_job(job_id).await
    }

    /// Appends a retry-scheduled annotation to the event log.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn note_retry_scheduled(&self, job_id: JobId, delay: Duration) -> JobsResult<()> {
        self.log
            .append(job_id, JobEventKind::RetryScheduled { delay })
            .await?;
        Ok(())
    }

    /// Lists dead-lettered jobs.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn dead_letters(&self) -> JobsResult<Vec<crate::dead_letter::DeadLetterEntry>> {
        self.dead_letter.all().await
    }

    /// Restores a consistent state after a restart.
    ///
    /// Jobs that were in flight when the server stopped are sent back to
    /// `Pending` as rejected assignment rounds; terminal jobs are left
    /// untouched. Returns the number of jobs recovered.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn recover(&self) -> JobsResult<usize> {
        let mut recovered = 0;
        for status in [JobStatus::Assigned, JobStatus::Running] {
            for job in self.store.list_by_status(status).await? {
                if self
                    .apply(
                        job.id,
                        JobTrigger::Reject {
                            reason: "server restart".into(),
                        },
                    )
                    .await?
                {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "in-flight jobs returned to pending after restart");
        }
        Ok(recovered)
    }

    fn job_lock(&self, job_id: JobId) -> Arc<Mutex<()>> {
        self.locks
            .entry(job_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::InMemoryDeadLetter;
    use crate::events::InMemoryEventLog;
    use crate::store::InMemoryJobStore;
    use bytes::Bytes;
    use mesh_primitives::JobResult;

    fn service() -> JobService {
        JobService::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryEventLog::default()),
            Arc::new(InMemoryDeadLetter::default()),
            JobDefaults {
                timeout: Duration::from_secs(60),
                max_retries: 2,
            },
        )
    }

    fn request(key: Option<&str>) -> JobRequest {
        let mut request = JobRequest::new("echo");
        request.idempotency_key = key.map(String::from);
        request
    }

    #[tokio::test]
    async fn repeated_submission_returns_same_job() {
        let service = service();
        let first = service.submit(request(Some("K1"))).await.unwrap();
        assert!(first.is_created());

        for _ in 0..5 {
            let receipt = service.submit(request(Some("K1"))).await.unwrap();
            assert!(!receipt.is_created());
            assert_eq!(receipt.job_id(), first.job_id());
        }
    }

    #[tokio::test]
    async fn full_lifecycle_updates_record_and_log() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();

        assert!(service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap());
        let job = service.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Assigned);
        assert_eq!(job.assigned_agent_id, Some(agent));
        assert_eq!(job.attempt_count, 1);

        assert!(service.apply(job_id, JobTrigger::Start).await.unwrap());
        let result = JobResult::success(job_id, Bytes::from_static(b"done"));
        assert!(
            service
                .apply(job_id, JobTrigger::Complete(result))
                .await
                .unwrap()
        );

        let job = service.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.assigned_agent_id.is_none());
        assert_eq!(job.result, Some(Bytes::from_static(b"done")));
        assert!(job.completed_at.is_some());

        let kinds: Vec<_> = service
            .events(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Submitted,
                JobEventKind::Assigned { agent_id: agent },
                JobEventKind::Started,
                JobEventKind::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn illegal_transition_is_noop() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();

        assert!(!service.apply(job_id, JobTrigger::Start).await.unwrap());
        assert_eq!(service.get(job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_is_write_once() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();

        service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap();
        service.apply(job_id, JobTrigger::Start).await.unwrap();
        let result = JobResult::success(job_id, Bytes::new());
        service
            .apply(job_id, JobTrigger::Complete(result.clone()))
            .await
            .unwrap();

        // A second result is acknowledged but discarded.
        assert!(
            !service
                .apply(job_id, JobTrigger::Complete(result))
                .await
                .unwrap()
        );
        assert!(
            !service
                .apply(
                    job_id,
                    JobTrigger::Cancel {
                        reason: "too late".into()
                    }
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();

        // max_retries = 2 allows exactly three execution attempts.
        for attempt in 1..=3u32 {
            assert!(service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap());
            assert!(service.apply(job_id, JobTrigger::Start).await.unwrap());
            assert!(
                service
                    .apply(
                        job_id,
                        JobTrigger::Fail {
                            error: "handler exploded".into(),
                            error_code: Some("E_EXEC".into()),
                        }
                    )
                    .await
                    .unwrap()
            );
            let job = service.get(job_id).await.unwrap();
            assert_eq!(job.attempt_count, attempt);
            if attempt < 3 {
                assert!(service.apply(job_id, JobTrigger::Retry).await.unwrap());
            }
        }

        let job = service.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.is_terminal());
        assert!(!service.apply(job_id, JobTrigger::Retry).await.unwrap());

        let dead = service.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, job_id);
    }

    #[tokio::test]
    async fn cancel_in_flight_names_agent() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();
        service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap();
        service.apply(job_id, JobTrigger::Start).await.unwrap();

        let outcome = service.cancel(job_id, "operator request").await.unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.notify_agent, Some(agent));
        assert_eq!(
            service.get(job_id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn progress_dropped_after_terminal() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();
        service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap();
        service.apply(job_id, JobTrigger::Start).await.unwrap();

        let progress = JobProgress {
            job_id,
            percent: 50,
            message: Some("halfway".into()),
            reported_at: Utc::now(),
        };
        assert!(service.set_progress(progress.clone()).await.unwrap());

        service
            .apply(job_id, JobTrigger::Complete(JobResult::success(job_id, Bytes::new())))
            .await
            .unwrap();
        assert!(!service.set_progress(progress).await.unwrap());

        let job = service.get(job_id).await.unwrap();
        assert_eq!(job.last_progress.as_ref().map(|p| p.percent), Some(50));
    }

    #[tokio::test]
    async fn recovery_returns_in_flight_to_pending() {
        let service = service();
        let job_id = service.submit(request(None)).await.unwrap().job_id();
        let agent = AgentId::random();
        service.apply(job_id, JobTrigger::Assign(agent)).await.unwrap();
        service.apply(job_id, JobTrigger::Start).await.unwrap();

        assert_eq!(service.recover().await.unwrap(), 1);
        let job = service.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_agent_id.is_none());
    }
}
