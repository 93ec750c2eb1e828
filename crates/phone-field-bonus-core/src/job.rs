use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::{
    expiry_after, unix_millis, AwardGuard, BonusError, Clock, GuardOutcome, StatOutcome, UserId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Dead,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Dead => "dead",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "dead" => Some(Self::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: u64,
    pub user_id: UserId,
    pub status: JobStatus,
    /// Attempts started so far, including the one in progress.
    pub attempts: u32,
    pub run_at_ms: i64,
    pub last_error: Option<String>,
}

/// Host job runner for deferred award attempts.
pub trait JobQueue: Send + Sync {
    /// Schedules an award attempt for `user_id` after `delay`. Returns the job id.
    #[allow(clippy::missing_errors_doc)]
    fn enqueue(&self, user_id: UserId, delay: Duration) -> Result<u64>;

    /// Marks up to `limit` pending jobs whose run time has passed as running,
    /// counting the attempt, and returns them oldest first.
    #[allow(clippy::missing_errors_doc)]
    fn claim_due(&self, limit: usize) -> Result<Vec<QueuedJob>>;

    #[allow(clippy::missing_errors_doc)]
    fn complete(&self, job_id: u64) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn retry(&self, job_id: u64, run_at: OffsetDateTime, error: &str) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn discard(&self, job_id: u64, error: &str) -> Result<()>;

    /// Every job not yet completed, by id.
    #[allow(clippy::missing_errors_doc)]
    fn jobs(&self) -> Result<Vec<QueuedJob>>;
}

/// In-process [`JobQueue`].
pub struct MemoryJobQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    next_id: u64,
    jobs: BTreeMap<u64, QueuedJob>,
}

impl MemoryJobQueue {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryQueueState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("job queue lock poisoned"))
    }

    fn update(&self, job_id: u64, apply: impl FnOnce(&mut QueuedJob)) -> Result<()> {
        let mut state = self.lock()?;
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        apply(job);
        Ok(())
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, user_id: UserId, delay: Duration) -> Result<u64> {
        let run_at_ms = unix_millis(expiry_after(self.clock.now(), delay)?);
        let mut state = self.lock()?;
        state.next_id += 1;
        let id = state.next_id;
        state.jobs.insert(
            id,
            QueuedJob {
                id,
                user_id,
                status: JobStatus::Pending,
                attempts: 0,
                run_at_ms,
                last_error: None,
            },
        );
        Ok(id)
    }

    fn claim_due(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        let now_ms = unix_millis(self.clock.now());
        let mut state = self.lock()?;
        let mut due = state
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Pending && job.run_at_ms <= now_ms)
            .collect::<Vec<_>>();
        due.sort_by_key(|job| (job.run_at_ms, job.id));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.clone()
            })
            .collect())
    }

    fn complete(&self, job_id: u64) -> Result<()> {
        self.lock()?
            .jobs
            .remove(&job_id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("job {job_id} not found"))
    }

    fn retry(&self, job_id: u64, run_at: OffsetDateTime, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Pending;
            job.run_at_ms = unix_millis(run_at);
            job.last_error = Some(error.to_string());
        })
    }

    fn discard(&self, job_id: u64, error: &str) -> Result<()> {
        self.update(job_id, |job| {
            job.status = JobStatus::Dead;
            job.last_error = Some(error.to_string());
        })
    }

    fn jobs(&self) -> Result<Vec<QueuedJob>> {
        Ok(self.lock()?.jobs.values().cloned().collect())
    }
}

/// Bounded retry with polynomial backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 15,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following attempt number `attempt`:
    /// `base + attempt^4` seconds.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let attempt = u64::from(attempt);
        let growth = attempt.saturating_mul(attempt).saturating_mul(attempt).saturating_mul(attempt);
        Duration::from_secs(self.base_delay_secs.saturating_add(growth))
    }

    #[must_use]
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobDisposition {
    Processed,
    Skipped,
}

/// One deferred award attempt for one user.
#[derive(Clone)]
pub struct AwardJob {
    guard: Arc<AwardGuard>,
}

impl AwardJob {
    #[must_use]
    pub fn new(guard: Arc<AwardGuard>) -> Self {
        Self { guard }
    }

    /// # Errors
    /// Returns [`BonusError::NotFound`] for unknown users and a retryable
    /// [`BonusError::Transient`] when the scoring backend failed.
    pub fn execute(&self, user_id: UserId) -> Result<JobDisposition, BonusError> {
        let settings = self.guard.load_settings()?;
        if !settings.enabled {
            debug!(user_id = user_id.0, "phone field bonus disabled, skipping job");
            return Ok(JobDisposition::Skipped);
        }

        let outcome = match self.guard.check_user(user_id) {
            Ok(outcome) => outcome,
            Err(BonusError::NotFound(user_id)) => {
                warn!(user_id = user_id.0, "award job for unknown user");
                return Err(BonusError::NotFound(user_id));
            }
            Err(err) => return Err(err),
        };

        match outcome {
            GuardOutcome::Awarded { .. } => {
                self.guard.stats.record(StatOutcome::Processed, &settings);
                info!(user_id = user_id.0, "award job processed user");
                Ok(JobDisposition::Processed)
            }
            GuardOutcome::AwardFailed => Err(BonusError::Transient(format!(
                "scoring backend failed for user {user_id}"
            ))),
            other => {
                self.guard.stats.record(StatOutcome::Skipped, &settings);
                debug!(user_id = user_id.0, outcome = other.as_str(), "award job needed no action");
                Ok(JobDisposition::Skipped)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub discarded: usize,
}

/// Drains due award jobs from a [`JobQueue`].
pub struct JobWorker {
    job: AwardJob,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl JobWorker {
    #[must_use]
    pub fn new(
        job: AwardJob,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            job,
            queue,
            policy,
            clock,
        }
    }

    /// Runs up to `limit` due jobs.
    ///
    /// # Errors
    /// Returns an error when the queue itself cannot be read or updated; job
    /// failures are recorded on the job instead.
    pub fn run_due(&self, limit: usize) -> Result<WorkerReport> {
        let jobs = self.queue.claim_due(limit)?;
        let mut report = WorkerReport {
            claimed: jobs.len(),
            ..WorkerReport::default()
        };

        for job in jobs {
            match self.job.execute(job.user_id) {
                Ok(_) => {
                    self.queue.complete(job.id)?;
                    report.completed += 1;
                }
                Err(err) if err.is_retryable() && self.policy.allows_another(job.attempts) => {
                    let backoff = self.policy.backoff(job.attempts);
                    let run_at = expiry_after(self.clock.now(), backoff)?;
                    debug!(job_id = job.id, user_id = job.user_id.0, attempts = job.attempts, error = %err, "rescheduling award job");
                    self.queue.retry(job.id, run_at, &err.to_string())?;
                    report.retried += 1;
                }
                Err(err) => {
                    warn!(job_id = job.id, user_id = job.user_id.0, attempts = job.attempts, error = %err, "discarding award job");
                    self.queue.discard(job.id, &err.to_string())?;
                    report.discarded += 1;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Awarder, BonusSettings, ManualClock, MemoryKeyValueStore, MemoryUserStore,
        ScoringBackend, StaticSettings, AWARDED_FIELD,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyBackend {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl ScoringBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn award(&self, _user_id: UserId, _points: i64, _description: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(anyhow!("score api unavailable"));
            }
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        users: Arc<MemoryUserStore>,
        queue: Arc<MemoryJobQueue>,
        backend: Arc<FlakyBackend>,
        guard: Arc<AwardGuard>,
        worker: JobWorker,
    }

    fn must<T, E: std::fmt::Display>(result: std::result::Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture(settings: BonusSettings) -> Fixture {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let kv = Arc::new(MemoryKeyValueStore::new(clock.clone()));
        let users = Arc::new(MemoryUserStore::new());
        let queue = Arc::new(MemoryJobQueue::new(clock.clone()));
        let backend = Arc::new(FlakyBackend::default());
        let guard = Arc::new(AwardGuard::new(
            Arc::new(StaticSettings::new(settings)),
            kv,
            users.clone(),
            Awarder::new(Some(backend.clone())),
            clock.clone(),
        ));
        let worker = JobWorker::new(
            AwardJob::new(guard.clone()),
            queue.clone(),
            RetryPolicy::default(),
            clock.clone(),
        );
        Fixture {
            clock,
            users,
            queue,
            backend,
            guard,
            worker,
        }
    }

    fn enabled() -> BonusSettings {
        BonusSettings {
            enabled: true,
            rate_limit_max_checks: 50,
            ..BonusSettings::default()
        }
    }

    #[test]
    fn backoff_grows_with_fourth_power() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(15));
        assert_eq!(policy.backoff(1), Duration::from_secs(16));
        assert_eq!(policy.backoff(3), Duration::from_secs(96));
        assert!(policy.allows_another(4));
        assert!(!policy.allows_another(5));
    }

    #[test]
    fn queue_claims_only_due_jobs() {
        let fixture = fixture(enabled());
        let later = must(fixture.queue.enqueue(UserId(1), Duration::from_secs(30)));
        let now = must(fixture.queue.enqueue(UserId(2), Duration::ZERO));

        let claimed = must(fixture.queue.claim_due(10));
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, now);
        assert_eq!(claimed[0].attempts, 1);
        assert!(must(fixture.queue.claim_due(10)).is_empty());

        fixture.clock.advance(Duration::from_secs(30));
        let claimed = must(fixture.queue.claim_due(10));
        assert_eq!(claimed.iter().map(|job| job.id).collect::<Vec<_>>(), vec![later]);
    }

    #[test]
    fn enqueue_rejects_delays_past_the_calendar() {
        let fixture = fixture(enabled());
        assert!(fixture
            .queue
            .enqueue(UserId(1), Duration::from_secs(u64::MAX))
            .is_err());
        must(fixture.queue.enqueue(UserId(1), Duration::ZERO));
        assert_eq!(must(fixture.queue.jobs()).len(), 1);
    }

    #[test]
    fn job_awards_and_records_processed_stat() {
        let fixture = fixture(enabled());
        must(fixture.users.set_user_field(UserId(1), "1", "0612345678"));
        must(fixture.queue.enqueue(UserId(1), Duration::ZERO));

        let report = must(fixture.worker.run_due(10));
        assert_eq!(report.completed, 1);
        assert!(must(fixture.queue.jobs()).is_empty());

        let stats = must(fixture.guard.stats().for_date(fixture.guard.stats().today()));
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.success, 1);
    }

    #[test]
    fn job_for_awarded_or_ineligible_user_is_skipped() {
        let fixture = fixture(enabled());
        must(fixture.users.set_user_field(UserId(1), "1", "12345"));
        let job = AwardJob::new(fixture.guard.clone());

        assert_eq!(must(job.execute(UserId(1))), JobDisposition::Skipped);
        let stats = must(fixture.guard.stats().for_date(fixture.guard.stats().today()));
        assert_eq!(stats.skipped, 1);
        assert_eq!(fixture.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_job_skips_without_touching_user() {
        let fixture = fixture(BonusSettings::default());
        let job = AwardJob::new(fixture.guard.clone());
        assert_eq!(must(job.execute(UserId(404))), JobDisposition::Skipped);
    }

    #[test]
    fn unknown_user_is_discarded_without_retry() {
        let fixture = fixture(enabled());
        must(fixture.queue.enqueue(UserId(404), Duration::ZERO));

        let report = must(fixture.worker.run_due(10));
        assert_eq!(report.discarded, 1);
        let jobs = must(fixture.queue.jobs());
        assert_eq!(jobs[0].status, JobStatus::Dead);
        assert_eq!(jobs[0].last_error.as_deref(), Some("user 404 not found"));
    }

    #[test]
    fn backend_failures_retry_with_backoff_then_succeed() {
        let fixture = fixture(enabled());
        fixture.backend.fail.store(true, Ordering::SeqCst);
        must(fixture.users.set_user_field(UserId(7), "1", "0612345678"));
        must(fixture.queue.enqueue(UserId(7), Duration::ZERO));

        let report = must(fixture.worker.run_due(10));
        assert_eq!(report.retried, 1);
        let jobs = must(fixture.queue.jobs());
        assert_eq!(jobs[0].status, JobStatus::Pending);
        assert_eq!(jobs[0].run_at_ms, 16_000);

        fixture.clock.advance(Duration::from_secs(15));
        assert_eq!(must(fixture.worker.run_due(10)).claimed, 0);

        fixture.backend.fail.store(false, Ordering::SeqCst);
        fixture.clock.advance(Duration::from_secs(1));
        assert_eq!(must(fixture.worker.run_due(10)).completed, 1);
        assert_eq!(must(fixture.users.custom_field_writes(AWARDED_FIELD)), 1);
    }

    #[test]
    fn exhausted_retries_are_discarded() {
        let fixture = fixture(enabled());
        fixture.backend.fail.store(true, Ordering::SeqCst);
        must(fixture.users.set_user_field(UserId(8), "1", "0612345678"));
        must(fixture.queue.enqueue(UserId(8), Duration::ZERO));

        let mut discarded = 0;
        for _ in 0..5 {
            let report = must(fixture.worker.run_due(10));
            discarded += report.discarded;
            fixture.clock.advance(Duration::from_secs(3_600));
        }

        assert_eq!(discarded, 1);
        assert_eq!(fixture.backend.calls.load(Ordering::SeqCst), 5);
        let jobs = must(fixture.queue.jobs());
        assert_eq!(jobs[0].status, JobStatus::Dead);
        assert_eq!(jobs[0].attempts, 5);
    }
}
