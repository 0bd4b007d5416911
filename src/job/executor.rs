//! Job step executor
//!
//! Every submitted job gets a worker task, which is the only writer of that
//! job. The worker runs steps in order, applies each step's retry policy and
//! persists the job record after every change. Snapshots and notices are
//! published from the after-commit hook of that write, so observers never see
//! a state the store does not hold. Recording a step's success belongs to the
//! attempt: if that write does not commit, the attempt failed.
//!
//! A job whose terminal state has committed is archived. From then on only
//! the store knows about it.

use super::context::StepContext;
use super::model::{job_key, Job, JobStep, JOB_KEY_PREFIX};
use super::registry::{StepDefinition, StepRegistry};
use super::retry::RetryPolicy;
use crate::command::Correlator;
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::tx::{AfterCommitHook, TransactionManager};
use fleet_shared::job_state::{JobEvent, JobLifecycle, TransitionResult};
use fleet_shared::{now_ms, JobId, JobRecord, JobState, StepStatus};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const NOTICE_CAPACITY: usize = 256;

/// Published after every committed change to a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotice {
    pub job_id: JobId,
    pub state: JobState,
    pub step: usize,
}

/// Control phase of a job, guarded separately from its snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for a worker permit
    Queued,
    Running,
    StopRequested,
    Finished,
}

struct JobEntry {
    snapshot: watch::Sender<Job>,
    stop_tx: watch::Sender<bool>,
    phase: Mutex<Phase>,
    /// Set once the worker has exited
    done: watch::Sender<bool>,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        let (snapshot, _) = watch::channel(job);
        let (stop_tx, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            snapshot,
            stop_tx,
            phase: Mutex::new(Phase::Queued),
            done,
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Job {
        self.snapshot.borrow().clone()
    }

    /// Claim the normal end of the job; `false` when a stop got there first
    fn try_finish(&self) -> bool {
        let mut phase = self.phase();
        if *phase == Phase::StopRequested {
            return false;
        }
        *phase = Phase::Finished;
        true
    }
}

fn publish(entry: &JobEntry, notices: &broadcast::Sender<JobNotice>, job: &Job) {
    entry.snapshot.send_replace(job.clone());
    // no receivers is fine
    let _ = notices.send(JobNotice {
        job_id: job.id,
        state: job.state,
        step: job.current_step,
    });
}

enum StepOutcome {
    Succeeded,
    /// Failed with no attempts left, or with a permanent error
    Failed(FleetError),
    Fatal(FleetError),
    /// A stop request interrupted the step
    Abandoned,
}

enum End {
    Finish(JobEvent, Option<FleetError>),
    Stop,
}

pub struct JobExecutor {
    registry: Arc<StepRegistry>,
    correlator: Arc<Correlator>,
    transactions: Arc<TransactionManager>,
    config: Arc<OrchestratorConfig>,
    /// Jobs that have not committed a terminal state yet
    jobs: Mutex<HashMap<JobId, Arc<JobEntry>>>,
    next_id: AtomicU64,
    workers: Arc<Semaphore>,
    notices: broadcast::Sender<JobNotice>,
}

impl JobExecutor {
    pub fn new(
        registry: Arc<StepRegistry>,
        correlator: Arc<Correlator>,
        transactions: Arc<TransactionManager>,
        config: Arc<OrchestratorConfig>,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Arc::new(Self {
            registry,
            correlator,
            transactions,
            workers: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            notices,
        })
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Persist a new job in CREATED and hand it to a worker
    pub async fn submit(
        self: &Arc<Self>,
        target: impl Into<String>,
        steps: Vec<JobStep>,
    ) -> Result<JobId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut job = Job::new(id, target, steps);
        let entry = Arc::new(JobEntry::new(job.clone()));

        self.persist(&entry, &mut job).await?;
        self.lock_jobs().insert(id, entry.clone());

        info!(
            "[JOB] Submitted job {} for {} ({} step(s))",
            id,
            job.target,
            job.steps.len()
        );
        tokio::spawn(self.clone().run(job, entry));
        Ok(id)
    }

    /// Ask a running job to stop.
    ///
    /// The worker abandons the in-flight step, cancels the job's pending
    /// requests and settles at STOPPED. Stopping a job that is already
    /// stopping is a no-op.
    pub async fn stop(&self, job_id: JobId) -> Result<()> {
        let Some(entry) = self.tracked(job_id) else {
            return match self.persisted(job_id).await? {
                Some(job) => Err(FleetError::JobNotRunning {
                    job_id,
                    state: job.state,
                }),
                None => Err(FleetError::JobNotFound(job_id)),
            };
        };

        let mut phase = entry.phase();
        match *phase {
            Phase::Running => {
                *phase = Phase::StopRequested;
                drop(phase);
                entry.stop_tx.send_replace(true);
                info!("[JOB] Stop requested for job {}", job_id);
                Ok(())
            }
            Phase::StopRequested => Ok(()),
            Phase::Queued | Phase::Finished => Err(FleetError::JobNotRunning {
                job_id,
                state: entry.snapshot.borrow().state,
            }),
        }
    }

    /// Latest committed snapshot; archived jobs are read from the store
    pub async fn status(&self, job_id: JobId) -> Result<Job> {
        if let Some(entry) = self.tracked(job_id) {
            return Ok(entry.snapshot());
        }
        self.persisted(job_id)
            .await?
            .ok_or(FleetError::JobNotFound(job_id))
    }

    /// The job as currently recorded in the store
    pub async fn persisted(&self, job_id: JobId) -> Result<Option<Job>> {
        let Some(record) = self.transactions.store().read(&job_key(job_id)).await? else {
            return Ok(None);
        };
        let record = JobRecord::from_bytes(&record.value)?;
        Ok(Some(Job::from_record(&record)))
    }

    /// Resolve once the job reaches a terminal state.
    ///
    /// Fails with `CommitFailure` if the worker gave up without committing
    /// one.
    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        let Some(entry) = self.tracked(job_id) else {
            return match self.persisted(job_id).await? {
                Some(job) if job.is_terminal() => Ok(job),
                _ => Err(FleetError::JobNotFound(job_id)),
            };
        };

        let mut done = entry.done.subscribe();
        if done.wait_for(|done| *done).await.is_err() {
            return Err(FleetError::Invariant(format!(
                "worker of job {} vanished",
                job_id
            )));
        }

        let job = entry.snapshot();
        if job.is_terminal() {
            Ok(job)
        } else {
            Err(FleetError::CommitFailure(format!(
                "job {} ended without a committed terminal state (last committed: {:?})",
                job_id, job.state
            )))
        }
    }

    /// Every known job by id: stored records, overlaid with the snapshots of
    /// jobs still in progress
    pub async fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = BTreeMap::new();
        for (_, record) in self.transactions.store().scan(JOB_KEY_PREFIX).await? {
            let job = Job::from_record(&JobRecord::from_bytes(&record.value)?);
            jobs.insert(job.id, job);
        }
        for entry in self.lock_jobs().values() {
            let job = entry.snapshot();
            jobs.insert(job.id, job);
        }
        Ok(jobs.into_values().collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotice> {
        self.notices.subscribe()
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, Arc<JobEntry>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracked(&self, job_id: JobId) -> Option<Arc<JobEntry>> {
        self.lock_jobs().get(&job_id).cloned()
    }

    fn policy_for(&self, step: &JobStep) -> RetryPolicy {
        step.retry
            .clone()
            .unwrap_or_else(|| self.config.retry_for(&step.definition_key).clone())
    }

    async fn run(self: Arc<Self>, job: Job, entry: Arc<JobEntry>) {
        let id = job.id;
        match self.drive(job, &entry).await {
            Ok(()) => {
                self.lock_jobs().remove(&id);
                debug!("[JOB] Job {} archived", id);
            }
            Err(e) => error!("[JOB] Job {} has no committed terminal state: {}", id, e),
        }
        *entry.phase() = Phase::Finished;
        entry.done.send_replace(true);
    }

    /// Take a worker permit and run the job until a terminal state commits
    async fn drive(&self, mut job: Job, entry: &Arc<JobEntry>) -> Result<()> {
        let _permit = self.workers.clone().acquire_owned().await.map_err(|_| {
            FleetError::Invariant(format!("worker pool closed before job {} started", job.id))
        })?;

        *entry.phase() = Phase::Running;
        let policy = self.config.default_retry.clone();
        self.transition_with_retry(entry, &mut job, JobEvent::Start, &policy)
            .await?;

        let mut stop_rx = entry.stop_tx.subscribe();
        let end = loop {
            if *stop_rx.borrow() {
                break End::Stop;
            }
            if job.current_step >= job.steps.len() {
                break End::Finish(JobEvent::AllStepsCompleted, None);
            }

            match self.run_step(entry, &mut job, &mut stop_rx).await {
                StepOutcome::Succeeded => {}
                StepOutcome::Failed(e) => break End::Finish(JobEvent::StepExhausted, Some(e)),
                StepOutcome::Fatal(e) => break End::Finish(JobEvent::FatalError, Some(e)),
                StepOutcome::Abandoned => break End::Stop,
            }
        };

        match end {
            End::Finish(event, failure) if entry.try_finish() => {
                self.finish(entry, &mut job, event, failure).await
            }
            _ => self.settle_stopped(entry, &mut job).await,
        }
    }

    /// Run the current step until it succeeds, runs out of attempts or is
    /// interrupted by a stop request
    async fn run_step(
        &self,
        entry: &Arc<JobEntry>,
        job: &mut Job,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> StepOutcome {
        let index = job.current_step;
        let key = job.steps[index].definition_key.clone();

        let definition = match self.registry.lookup(&key) {
            Ok(definition) => definition,
            Err(e) => {
                let step = &mut job.steps[index];
                step.status = StepStatus::Failed;
                step.last_error = Some(e.to_string());
                return StepOutcome::Fatal(e);
            }
        };
        let policy = self.policy_for(&job.steps[index]);
        let properties = declared_properties(job.id, &definition, &job.steps[index]);

        loop {
            let step = &mut job.steps[index];
            step.attempts += 1;
            step.status = StepStatus::Running;
            let attempt = step.attempts;

            debug!(
                "[JOB] Job {} step {} ({}) attempt {}/{}",
                job.id, index, key, attempt, policy.max_attempts
            );
            let result = match self.save(entry, job).await {
                Ok(()) => {
                    let ctx = StepContext::new(
                        job.id,
                        job.target.clone(),
                        index,
                        attempt,
                        definition.clone(),
                        properties.clone(),
                        self.correlator.clone(),
                        self.transactions.clone(),
                        self.config.clone(),
                    );
                    tokio::select! {
                        biased;
                        _ = stop_rx.wait_for(|stop| *stop) => None,
                        result = definition.behavior().execute(&ctx) => Some(result),
                    }
                }
                Err(e) => Some(Err(e)),
            };

            let error = match result {
                None => return StepOutcome::Abandoned,
                Some(Ok(())) => match self.record_success(entry, job, index).await {
                    Ok(()) => return StepOutcome::Succeeded,
                    Err(e) => e,
                },
                Some(Err(e)) => e,
            };
            if *stop_rx.borrow() {
                return StepOutcome::Abandoned;
            }

            let step = &mut job.steps[index];
            step.last_error = Some(error.to_string());
            if error.is_fatal_to_job() {
                step.status = StepStatus::Failed;
                return StepOutcome::Fatal(error);
            }
            if !error.is_retryable() || !policy.allows_another(attempt) {
                step.status = StepStatus::Failed;
                return StepOutcome::Failed(error);
            }

            step.status = StepStatus::Pending;
            let delay = policy.delay_after(attempt);
            warn!(
                "[JOB] Job {} step {} ({}) attempt {}/{} failed: {}; retrying in {:?}",
                job.id, index, key, attempt, policy.max_attempts, error, delay
            );
            // a lost write here is carried by the next attempt's record
            let _ = self.save(entry, job).await;

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = stop_rx.wait_for(|stop| *stop) => return StepOutcome::Abandoned,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    /// Commit a successful attempt. The step only counts as done once this
    /// succeeds; on failure the in-memory job goes back to the running step.
    async fn record_success(
        &self,
        entry: &Arc<JobEntry>,
        job: &mut Job,
        index: usize,
    ) -> Result<()> {
        job.steps[index].status = StepStatus::Completed;
        job.current_step = index + 1;

        let result = self.save(entry, job).await;
        if result.is_err() {
            job.steps[index].status = StepStatus::Running;
            job.current_step = index;
        }
        result
    }

    /// Commit the terminal state under the closing step's policy. A COMPLETED
    /// that cannot be recorded ends the job at STEP_FAILED instead.
    async fn finish(
        &self,
        entry: &Arc<JobEntry>,
        job: &mut Job,
        event: JobEvent,
        failure: Option<FleetError>,
    ) -> Result<()> {
        if let Some(e) = failure {
            if event == JobEvent::FatalError {
                error!("[JOB] Job {} failed fatally: {}", job.id, e);
            } else {
                warn!(
                    "[JOB] Job {} step {} exhausted: {}",
                    job.id, job.current_step, e
                );
            }
            job.last_error = Some(e.to_string());
        }

        let policy = job
            .current()
            .or_else(|| job.steps.last())
            .map_or_else(|| self.config.default_retry.clone(), |step| self.policy_for(step));

        match self.transition_with_retry(entry, job, event, &policy).await {
            Err(e) if event == JobEvent::AllStepsCompleted => {
                warn!("[JOB] Job {} could not record completion: {}", job.id, e);
                job.last_error = Some(e.to_string());
                self.transition(entry, job, JobEvent::StepExhausted).await
            }
            result => result,
        }
    }

    /// RUNNING -> STOPPING, abandon the in-flight step, then STOPPED
    async fn settle_stopped(&self, entry: &Arc<JobEntry>, job: &mut Job) -> Result<()> {
        let policy = self.config.default_retry.clone();
        self.transition_with_retry(entry, job, JobEvent::StopRequested, &policy)
            .await?;

        self.correlator.cancel_owned_by(job.id);
        if let Some(step) = job.current_mut() {
            let in_flight = step.status == StepStatus::Running
                || (step.status == StepStatus::Pending && step.attempts > 0);
            if in_flight {
                step.status = StepStatus::Cancelled;
            }
        }

        self.transition_with_retry(entry, job, JobEvent::StopSettled, &policy)
            .await
    }

    async fn transition_with_retry(
        &self,
        entry: &Arc<JobEntry>,
        job: &mut Job,
        event: JobEvent,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transition(entry, job, event).await {
                Err(e) if e.is_retryable() && policy.allows_another(attempt) => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        "[JOB] Job {} could not record {:?} (attempt {}/{}): {}; retrying in {:?}",
                        job.id, event, attempt, policy.max_attempts, e, delay
                    );
                    sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Apply `event` and commit it. The in-memory state is rolled back when
    /// the write fails.
    async fn transition(
        &self,
        entry: &Arc<JobEntry>,
        job: &mut Job,
        event: JobEvent,
    ) -> Result<()> {
        let from = job.state;
        let state = match JobLifecycle::from_state(from).process_event(event) {
            TransitionResult::Success(state) => state,
            TransitionResult::Invalid { from, event } => {
                return Err(FleetError::Invariant(format!(
                    "job {} cannot take {:?} in state {:?}",
                    job.id, event, from
                )));
            }
        };

        job.state = state;
        if let Err(e) = self.save(entry, job).await {
            job.state = from;
            return Err(e);
        }
        info!("[JOB] Job {} {:?} -> {:?}", job.id, from, state);
        Ok(())
    }

    /// Persist from the worker. Nothing is published unless the write
    /// commits.
    async fn save(&self, entry: &Arc<JobEntry>, job: &mut Job) -> Result<()> {
        let result = self.persist(entry, job).await;
        if let Err(e) = &result {
            warn!("[JOB] Failed to persist job {}: {}", job.id, e);
        }
        result
    }

    /// Write the job record; the snapshot is published after commit
    async fn persist(&self, entry: &Arc<JobEntry>, job: &mut Job) -> Result<()> {
        job.updated_at_ms = now_ms();

        let key = job_key(job.id);
        let record = job.to_record().to_bytes();
        let snapshot = job.clone();

        let hook_entry = entry.clone();
        let notices = self.notices.clone();
        let hook: AfterCommitHook<Job> = Box::new(move |_, job| {
            publish(&hook_entry, &notices, job);
            Ok(())
        });

        self.transactions
            .execute(
                move |tx| {
                    Box::pin(async move {
                        tx.put(key, record);
                        Ok(snapshot)
                    })
                },
                vec![hook],
            )
            .await?;
        Ok(())
    }
}

/// Properties the definition declares; anything else is logged and dropped
fn declared_properties(
    job_id: JobId,
    definition: &StepDefinition,
    step: &JobStep,
) -> IndexMap<String, String> {
    step.properties
        .iter()
        .filter(|(name, _)| {
            let declared = definition.declares(name);
            if !declared {
                warn!(
                    "[JOB] Job {} ignores property {} not declared by {}",
                    job_id,
                    name,
                    definition.key()
                );
            }
            declared
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Backoff, RetryPolicy, StepBehavior};
    use crate::sim::SimulatedDevice;
    use crate::transport::MemoryBroker;
    use crate::tx::{MemoryStore, Record, Store, Version, Write};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Duration;
    use tokio::time::Instant;

    struct Succeed;

    #[async_trait]
    impl StepBehavior for Succeed {
        async fn execute(&self, _ctx: &StepContext) -> Result<()> {
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl StepBehavior for Fail {
        async fn execute(&self, _ctx: &StepContext) -> Result<()> {
            Err(FleetError::StepFailure("device rejected".into()))
        }
    }

    /// Fails a fixed number of times, then succeeds
    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StepBehavior for Flaky {
        async fn execute(&self, _ctx: &StepContext) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(FleetError::StepFailure("flaky link".into()));
            }
            Ok(())
        }
    }

    /// Asks the target for its status
    struct AskStatus;

    #[async_trait]
    impl StepBehavior for AskStatus {
        async fn execute(&self, ctx: &StepContext) -> Result<()> {
            let reply = ctx.request("status", "").await?;
            if reply.text().starts_with("version=") {
                Ok(())
            } else {
                Err(FleetError::StepFailure(reply.text()))
            }
        }
    }

    /// Requires `note`, and must never see undeclared properties
    struct Inspect;

    #[async_trait]
    impl StepBehavior for Inspect {
        async fn execute(&self, ctx: &StepContext) -> Result<()> {
            ctx.require("note")?;
            if ctx.property("bogus").is_some() {
                return Err(FleetError::StepFailure("saw undeclared property".into()));
            }
            Ok(())
        }
    }

    /// Writes `marker/{target}` through its own transaction
    struct RecordMarker;

    #[async_trait]
    impl StepBehavior for RecordMarker {
        async fn execute(&self, ctx: &StepContext) -> Result<()> {
            let key = format!("marker/{}", ctx.target());
            ctx.transactions()
                .execute(
                    move |tx| {
                        Box::pin(async move {
                            tx.put(key, "done");
                            Ok(())
                        })
                    },
                    vec![],
                )
                .await?;
            Ok(())
        }
    }

    struct Harness {
        broker: Arc<MemoryBroker>,
        executor: Arc<JobExecutor>,
    }

    fn registry() -> Arc<StepRegistry> {
        StepRegistry::builder()
            .register(StepDefinition::new("succeed", &[], Succeed))
            .and_then(|b| b.register(StepDefinition::new("fail", &[], Fail)))
            .and_then(|b| {
                b.register(StepDefinition::new(
                    "flaky",
                    &[],
                    Flaky {
                        failures_left: AtomicU32::new(2),
                    },
                ))
            })
            .and_then(|b| b.register(StepDefinition::new("ask", &[], AskStatus)))
            .and_then(|b| b.register(StepDefinition::new("inspect", &["note"], Inspect)))
            .and_then(|b| b.register(StepDefinition::new("marker", &[], RecordMarker)))
            .expect("register")
            .build()
    }

    async fn harness_with(config: OrchestratorConfig, store: Arc<dyn Store>) -> Harness {
        let config = Arc::new(config);
        let broker = Arc::new(MemoryBroker::new());
        let correlator = Correlator::start(broker.clone(), config.clone())
            .await
            .expect("start correlator");
        let transactions = Arc::new(TransactionManager::new(store));
        let executor = JobExecutor::new(registry(), correlator, transactions, config);
        Harness { broker, executor }
    }

    async fn harness(config: OrchestratorConfig) -> Harness {
        harness_with(config, Arc::new(MemoryStore::new())).await
    }

    fn once(key: &str) -> JobStep {
        JobStep::new(key).with_retry(RetryPolicy::once())
    }

    async fn until_pending(executor: &JobExecutor, target: &str) {
        for _ in 0..10_000 {
            if executor.correlator().pending_count_for(target) > 0 {
                return;
            }
            sleep(Duration::from_millis(1)).await;
        }
        panic!("no request to {} ever became pending", target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_halts_job() {
        let h = harness(OrchestratorConfig::default()).await;
        let id = h
            .executor
            .submit("edge-1", vec![once("succeed"), once("fail")])
            .await
            .expect("submit");

        let job = h.executor.wait(id).await.expect("wait");
        assert_eq!(job.state, JobState::StepFailed);
        assert_eq!(job.current_step, 1);
        assert_eq!(job.steps[0].status, StepStatus::Completed);
        assert_eq!(job.steps[1].status, StepStatus::Failed);
        assert_eq!(job.steps[1].attempts, 1);
        assert!(job.last_error.as_deref().unwrap_or("").contains("device rejected"));

        let stored = h.executor.persisted(id).await.expect("read").expect("present");
        assert_eq!(stored.state, JobState::StepFailed);
        assert_eq!(stored.current_step, 1);
    }

    #[tokio::test]
    async fn test_all_steps_complete() {
        let h = harness(OrchestratorConfig::default()).await;
        SimulatedDevice::new("edge-1", "1.0")
            .attach(h.broker.clone(), "fleet")
            .await
            .expect("attach");

        let id = h
            .executor
            .submit("edge-1", vec![once("succeed"), once("ask")])
            .await
            .expect("submit");

        let job = h.executor.wait(id).await.expect("wait");
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.current_step, 2);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Completed));

        let later = h.executor.status(id).await.expect("status");
        assert_eq!((later.state, later.current_step), (JobState::Completed, 2));
        let stored = h.executor.persisted(id).await.expect("read").expect("present");
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(h.executor.list().await.expect("list").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retried_with_backoff() {
        let h = harness(OrchestratorConfig::default()).await;
        let start = Instant::now();
        let step = JobStep::new("flaky")
            .with_retry(RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(100))));

        let id = h.executor.submit("edge-1", vec![step]).await.expect("submit");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.steps[0].attempts, 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_then_exhaust() {
        let config = OrchestratorConfig::default().with_request_timeout(Duration::from_millis(50));
        let h = harness(config).await;
        let step = JobStep::new("ask").with_retry(RetryPolicy::new(2, Backoff::None));

        let id = h.executor.submit("ghost", vec![step]).await.expect("submit");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::StepFailed);
        assert_eq!(job.steps[0].attempts, 2);
        assert!(job.steps[0].last_error.as_deref().unwrap_or("").contains("timed out"));
        assert_eq!(h.executor.correlator().stats().timeouts, 2);
        assert_eq!(h.executor.correlator().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_definition_is_fatal() {
        let h = harness(OrchestratorConfig::default()).await;
        let id = h
            .executor
            .submit("edge-1", vec![JobStep::new("flash-firmware")])
            .await
            .expect("submit");

        let job = h.executor.wait(id).await.expect("wait");
        assert_eq!(job.state, JobState::StepFailed);
        assert_eq!(job.steps[0].attempts, 0);
        assert!(job
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("Unknown step definition"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_step_cancels_pending_request() {
        let h = harness(OrchestratorConfig::default()).await;
        let mut notices = h.executor.subscribe();

        let id = h.executor.submit("ghost", vec![once("ask")]).await.expect("submit");
        until_pending(&h.executor, "ghost").await;

        h.executor.stop(id).await.expect("stop");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::Stopped);
        assert_eq!(job.steps[0].status, StepStatus::Cancelled);
        let stats = h.executor.correlator().stats();
        assert_eq!((stats.cancellations, stats.timeouts), (1, 0));
        assert_eq!(h.executor.correlator().pending_count(), 0);

        let mut states = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if states.last() != Some(&notice.state) {
                states.push(notice.state);
            }
        }
        assert_eq!(
            states,
            vec![
                JobState::Created,
                JobState::Running,
                JobState::Stopping,
                JobState::Stopped
            ]
        );

        let err = h.executor.stop(id).await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::JobNotRunning {
                state: JobState::Stopped,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let h = harness(OrchestratorConfig::default()).await;
        let start = Instant::now();
        let step =
            JobStep::new("fail").with_retry(RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(10))));
        let id = h.executor.submit("edge-1", vec![step]).await.expect("submit");

        loop {
            let job = h.executor.status(id).await.expect("status");
            if job.steps[0].attempts == 1 && job.steps[0].status == StepStatus::Pending {
                break;
            }
            sleep(Duration::from_millis(1)).await;
        }

        h.executor.stop(id).await.expect("stop");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::Stopped);
        assert_eq!(job.steps[0].attempts, 1);
        assert_eq!(job.steps[0].status, StepStatus::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_requires_running_job() {
        let h = harness(OrchestratorConfig::default().with_max_concurrent_jobs(1)).await;

        let blocking = h.executor.submit("ghost", vec![once("ask")]).await.expect("submit");
        until_pending(&h.executor, "ghost").await;
        let queued = h.executor.submit("edge-2", vec![once("succeed")]).await.expect("submit");

        let err = h.executor.stop(queued).await.unwrap_err();
        assert!(matches!(
            err,
            FleetError::JobNotRunning {
                state: JobState::Created,
                ..
            }
        ));
        assert!(matches!(
            h.executor.stop(999).await,
            Err(FleetError::JobNotFound(999))
        ));

        h.executor.stop(blocking).await.expect("stop");
        assert_eq!(h.executor.wait(blocking).await.expect("wait").state, JobState::Stopped);
        assert_eq!(h.executor.wait(queued).await.expect("wait").state, JobState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeclared_properties_dropped_and_missing_ones_fail() {
        let h = harness(OrchestratorConfig::default()).await;

        let ok = h
            .executor
            .submit(
                "edge-1",
                vec![JobStep::new("inspect")
                    .with_property("note", "hello")
                    .with_property("bogus", "x")],
            )
            .await
            .expect("submit");
        assert_eq!(h.executor.wait(ok).await.expect("wait").state, JobState::Completed);

        let missing = h
            .executor
            .submit("edge-1", vec![JobStep::new("inspect")])
            .await
            .expect("submit");
        let job = h.executor.wait(missing).await.expect("wait");
        assert_eq!(job.state, JobState::StepFailed);
        // permanent error: no retries despite the default policy
        assert_eq!(job.steps[0].attempts, 1);
        assert!(job
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("missing required property note"));
    }

    struct RejectingStore;

    #[async_trait]
    impl Store for RejectingStore {
        async fn read(&self, _key: &str) -> Result<Option<Record>> {
            Ok(None)
        }

        async fn commit(
            &self,
            _tx_id: u64,
            _writes: Vec<Write>,
            _reads: HashMap<String, Option<Version>>,
        ) -> Result<()> {
            Err(FleetError::CommitFailure("store offline".into()))
        }

        async fn scan(&self, _prefix: &str) -> Result<Vec<(String, Record)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_nothing_published_without_commit() {
        let h = harness_with(OrchestratorConfig::default(), Arc::new(RejectingStore)).await;
        let mut notices = h.executor.subscribe();

        let err = h
            .executor
            .submit("edge-1", vec![once("succeed")])
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::CommitFailure(_)));
        assert!(h.executor.list().await.expect("list").is_empty());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_job_is_archived() {
        let h = harness(OrchestratorConfig::default()).await;
        let id = h.executor.submit("edge-1", vec![once("succeed")]).await.expect("submit");

        let job = h.executor.wait(id).await.expect("wait");
        assert_eq!(job.state, JobState::Completed);
        assert!(h.executor.lock_jobs().is_empty());

        // answered from the store from here on
        assert_eq!(h.executor.status(id).await.expect("status").state, JobState::Completed);
        assert_eq!(h.executor.wait(id).await.expect("wait").state, JobState::Completed);
        let listed = h.executor.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert!(matches!(
            h.executor.stop(id).await,
            Err(FleetError::JobNotRunning {
                state: JobState::Completed,
                ..
            })
        ));
        assert!(matches!(h.executor.wait(999).await, Err(FleetError::JobNotFound(999))));
    }

    type RejectFn = Box<dyn Fn(u32, &[Write]) -> bool + Send + Sync>;

    /// `MemoryStore` that rejects the commits `reject` picks, given the
    /// 1-based commit number and the writes
    struct FlakyStore {
        inner: MemoryStore,
        commits: AtomicU32,
        reject: RejectFn,
    }

    impl FlakyStore {
        fn new(reject: impl Fn(u32, &[Write]) -> bool + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                commits: AtomicU32::new(0),
                reject: Box::new(reject),
            })
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn read(&self, key: &str) -> Result<Option<Record>> {
            self.inner.read(key).await
        }

        async fn commit(
            &self,
            tx_id: u64,
            writes: Vec<Write>,
            reads: HashMap<String, Option<Version>>,
        ) -> Result<()> {
            let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
            if (self.reject)(n, &writes) {
                return Err(FleetError::CommitFailure(format!("commit {} rejected", n)));
            }
            self.inner.commit(tx_id, writes, reads).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<(String, Record)>> {
            self.inner.scan(prefix).await
        }
    }

    fn touches_marker(writes: &[Write]) -> bool {
        writes.iter().any(|w| w.key().starts_with("marker/"))
    }

    // Commits: 1 submit, 2 start, 3 attempt, 4 step outcome.

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_success_is_retried() {
        let store = FlakyStore::new(|n, _| n == 4);
        let h = harness_with(OrchestratorConfig::default(), store).await;
        let first = JobStep::new("succeed").with_retry(RetryPolicy::new(2, Backoff::None));

        let id = h
            .executor
            .submit("edge-1", vec![first, once("succeed")])
            .await
            .expect("submit");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.steps[0].attempts, 2);
        assert!(job.steps[0]
            .last_error
            .as_deref()
            .unwrap_or("")
            .contains("Commit failed"));
        let stored = h.executor.persisted(id).await.expect("read").expect("present");
        assert_eq!((stored.state, stored.current_step), (JobState::Completed, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncommitted_progress_is_never_published() {
        let store = FlakyStore::new(|n, _| n >= 4);
        let h = harness_with(OrchestratorConfig::default(), store).await;
        let mut notices = h.executor.subscribe();

        let id = h
            .executor
            .submit("edge-1", vec![once("succeed"), once("succeed")])
            .await
            .expect("submit");

        let err = h.executor.wait(id).await.unwrap_err();
        assert!(matches!(err, FleetError::CommitFailure(_)));

        let seen = h.executor.status(id).await.expect("status");
        let stored = h.executor.persisted(id).await.expect("read").expect("present");
        assert_eq!((seen.state, seen.current_step), (JobState::Running, 0));
        assert_eq!((stored.state, stored.current_step), (JobState::Running, 0));
        assert_eq!(seen.steps[0].status, stored.steps[0].status);

        while let Ok(notice) = notices.try_recv() {
            assert!(matches!(notice.state, JobState::Created | JobState::Running));
            assert_eq!(notice.step, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_commit_failure_is_retried() {
        let rejected = AtomicBool::new(false);
        let store = FlakyStore::new(move |_, writes| {
            touches_marker(writes) && !rejected.swap(true, Ordering::SeqCst)
        });
        let h = harness_with(OrchestratorConfig::default(), store.clone()).await;
        let step = JobStep::new("marker").with_retry(RetryPolicy::new(3, Backoff::None));

        let id = h.executor.submit("edge-1", vec![step]).await.expect("submit");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.steps[0].attempts, 2);
        assert!(store.inner.read("marker/edge-1").await.expect("read").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_commit_failure_exhausts_attempts() {
        let store = FlakyStore::new(|_, writes| touches_marker(writes));
        let h = harness_with(OrchestratorConfig::default(), store.clone()).await;
        let step = JobStep::new("marker").with_retry(RetryPolicy::new(3, Backoff::None));

        let id = h.executor.submit("edge-1", vec![step]).await.expect("submit");
        let job = h.executor.wait(id).await.expect("wait");

        assert_eq!(job.state, JobState::StepFailed);
        assert_eq!(job.steps[0].status, StepStatus::Failed);
        assert_eq!(job.steps[0].attempts, 3);
        assert!(job.last_error.as_deref().unwrap_or("").contains("Commit failed"));

        let stored = h.executor.persisted(id).await.expect("read").expect("present");
        assert_eq!(stored.state, JobState::StepFailed);
        assert!(store.inner.read("marker/edge-1").await.expect("read").is_none());
    }
}
