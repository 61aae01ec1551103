//! Boundary contracts consumed by the coordinator. Implementations are
//! external collaborators; `preagg_store` ships the production ones.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Job, JobId, JobNotification, JobStatus, PreaggError, PreaggResult, TeamId, TimeRange,
    TransitionFields,
};

/// Outcome of an attempt to claim a range. `AlreadyClaimed` is an expected,
/// benign result — callers branch on it rather than catching a storage
/// error.
#[derive(Clone, Debug)]
pub enum CreateOutcome {
    Created(Job),
    AlreadyClaimed,
}

/// Storage of materialization jobs.
///
/// `create` is the subsystem's only mutual-exclusion primitive: it must be a
/// single atomic insert whose conflict detection lives in the storage layer
/// (a uniqueness constraint), never an application-level check-then-insert.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Non-expired `Ready`/`Pending` jobs overlapping `range`, ordered by
    /// range start.
    async fn find_existing(
        &self,
        team: TeamId,
        query_hash: &str,
        range: TimeRange,
    ) -> PreaggResult<Vec<Job>>;

    /// Atomically inserts a `Pending` job with `expires_at = now + ttl`.
    /// Returns `AlreadyClaimed` when a `Pending` job already exists for the
    /// exact same `(team, query_hash, range)`.
    async fn create(
        &self,
        team: TeamId,
        query_hash: &str,
        range: TimeRange,
        ttl_seconds: u64,
    ) -> PreaggResult<CreateOutcome>;

    /// Conditional transition; returns whether *this* call applied it. Used
    /// both by the owning caller for normal completion and by peers for
    /// stale-job reclamation, so only one caller publishes afterwards.
    async fn transition_if_status(
        &self,
        job_id: JobId,
        expected: JobStatus,
        new_status: JobStatus,
        fields: TransitionFields,
    ) -> PreaggResult<bool>;
}

/// Open subscription spanning one or more job channels.
#[async_trait]
pub trait Subscription: Send {
    /// Adds further job channels to this subscription.
    async fn extend(&mut self, job_ids: &[JobId]) -> PreaggResult<()>;

    /// Blocks until any subscribed channel delivers, or `timeout` elapses.
    async fn wait(&mut self, timeout: Duration) -> PreaggResult<Option<JobNotification>>;
}

/// Per-job wakeup channel. Delivery is best-effort: the coordinator re-reads
/// the repository after every wakeup, so a dropped message only costs
/// latency.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, job_id: JobId, status: JobStatus) -> PreaggResult<()>;
    async fn subscribe(&self, job_ids: &[JobId]) -> PreaggResult<Box<dyn Subscription>>;
}

/// Heartbeat-based staleness detection for in-flight computations.
#[async_trait]
pub trait LivenessProber: Send + Sync {
    /// Records that the computation for `job_id` has begun. Calling this
    /// twice for one id is a caller bug and must fail loudly.
    async fn mark_computation_started(&self, job_id: JobId) -> PreaggResult<()>;

    async fn has_computation_started(&self, job_id: JobId) -> PreaggResult<bool>;

    /// Whether a recent heartbeat for this job's computation was observed.
    async fn is_computation_alive(&self, team: TeamId, job_id: JobId) -> PreaggResult<bool>;

    /// A pending job is stale when its owner is presumed dead: never if a
    /// heartbeat is current; otherwise once its age exceeds `grace_period`
    /// (computation never started) or `stale_threshold` (heartbeats
    /// stopped).
    async fn is_stale(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        grace_period: Duration,
        stale_threshold: Duration,
    ) -> PreaggResult<bool> {
        if self.is_computation_alive(job.team_id, job.id).await? {
            return Ok(false);
        }
        let age = now - job.created_at;
        let threshold = if self.has_computation_started(job.id).await? {
            stale_threshold
        } else {
            grace_period
        };
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        Ok(age > threshold)
    }
}

/// Caller-supplied unit of work. Implementations must call
/// `mark_computation_started` before their first external write and emit
/// heartbeats for the duration of the computation.
#[async_trait]
pub trait JobComputer: Send + Sync {
    async fn compute(&self, team: TeamId, job: &Job) -> PreaggResult<()>;
}

/// Classifies compute failures. Non-retryable failures abort the whole
/// `execute` call; everything else counts against the shared retry budget.
pub trait ErrorClassifier: Send + Sync {
    fn is_non_retryable(&self, error: &PreaggError) -> bool;
}

/// Default classifier: every compute failure is worth retrying.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryAllClassifier;

impl ErrorClassifier for RetryAllClassifier {
    fn is_non_retryable(&self, _error: &PreaggError) -> bool {
        false
    }
}
