//! Orchestration loop tying coverage planning, the job repository, the
//! notification bus, and staleness reclamation together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::api::{
    CreateOutcome, ErrorClassifier, JobComputer, JobRepository, LivenessProber, NotificationBus,
    RetryAllClassifier, Subscription,
};
use crate::windows::{filter_by_freshness, filter_overlapping_jobs, missing_windows, split_by_ttl};
use crate::{
    Clock, Job, JobId, JobStatus, PreaggError, PreaggResult, QueryInfo, TeamId, TimeRange,
    TransitionFields, TtlSchedule,
};

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Overall deadline for one `execute` call.
    pub wait_timeout: Duration,
    /// First peer-wait interval; doubled after every silent wait.
    pub backoff_initial: Duration,
    /// Upper bound for the doubled wait interval.
    pub backoff_cap: Duration,
    /// Shared budget of retryable compute failures per call.
    pub max_retries: u32,
    /// Age before a pending job whose computation never started is stale.
    pub grace_period: Duration,
    /// Age before a pending job whose heartbeats stopped is stale.
    pub stale_threshold: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(300),
            backoff_initial: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            max_retries: 3,
            grace_period: Duration::from_secs(120),
            stale_threshold: Duration::from_secs(900),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    NonRetryable,
    Retryable,
    RetryBudgetExhausted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteFailure {
    pub kind: FailureKind,
    pub job_id: Option<JobId>,
    pub message: String,
}

/// Result of one `execute` call: either full coverage (`ready` with the
/// covering job ids) or a full failure with the collected errors. Never a
/// partial result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutcome {
    pub ready: bool,
    pub job_ids: Vec<JobId>,
    pub errors: Vec<ExecuteFailure>,
}

impl ExecuteOutcome {
    fn failed(errors: Vec<ExecuteFailure>) -> Self {
        Self {
            ready: false,
            job_ids: Vec::new(),
            errors,
        }
    }
}

pub struct Coordinator {
    repository: Arc<dyn JobRepository>,
    bus: Arc<dyn NotificationBus>,
    prober: Arc<dyn LivenessProber>,
    clock: Arc<dyn Clock>,
    classifier: Arc<dyn ErrorClassifier>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        bus: Arc<dyn NotificationBus>,
        prober: Arc<dyn LivenessProber>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            prober,
            clock,
            classifier: Arc::new(RetryAllClassifier),
            config,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Guarantees every day window of `range` is covered by a non-expired
    /// materialization for `query`, computing only the missing portions via
    /// `computer`. Concurrent callers for the same fingerprint coordinate
    /// through the repository's atomic create and the notification bus.
    pub async fn execute(
        &self,
        team: TeamId,
        query: &QueryInfo,
        schedule: &TtlSchedule,
        range: TimeRange,
        computer: &dyn JobComputer,
    ) -> PreaggResult<ExecuteOutcome> {
        let query_hash = query.fingerprint()?;
        let wait_timeout = chrono::Duration::from_std(self.config.wait_timeout)
            .map_err(|_| PreaggError::configuration("wait_timeout out of range"))?;
        let deadline = self.clock.now() + wait_timeout;

        let mut backoff = self.config.backoff_initial;
        let mut failures: u32 = 0;
        let mut errors: Vec<ExecuteFailure> = Vec::new();
        let mut subscription: Option<Box<dyn Subscription>> = None;
        let mut subscribed: HashSet<JobId> = HashSet::new();

        loop {
            let now = self.clock.now();
            if now >= deadline {
                errors.push(ExecuteFailure {
                    kind: FailureKind::Timeout,
                    job_id: None,
                    message: format!(
                        "no full coverage for {range} within {:?}",
                        self.config.wait_timeout
                    ),
                });
                return Ok(ExecuteOutcome::failed(errors));
            }

            let existing = self
                .repository
                .find_existing(team, &query_hash, range)
                .await?;
            let fresh = filter_by_freshness(existing, schedule, now);
            let pending: Vec<Job> = fresh
                .iter()
                .filter(|job| job.status == JobStatus::Pending)
                .cloned()
                .collect();
            let missing = missing_windows(&fresh, range.start, range.end);
            debug!(
                "team {team} query {query_hash}: {} fresh, {} pending, {} missing ranges",
                fresh.len(),
                pending.len(),
                missing.len()
            );

            if !missing.is_empty() {
                let mut progressed = false;
                for (chunk, ttl_seconds) in split_by_ttl(&missing, schedule) {
                    match self
                        .repository
                        .create(team, &query_hash, chunk, ttl_seconds)
                        .await?
                    {
                        CreateOutcome::AlreadyClaimed => {
                            debug!("range {chunk} already claimed by a peer");
                            progressed = true;
                        }
                        CreateOutcome::Created(job) => {
                            info!("claimed {chunk} as job {}", job.id);
                            match computer.compute(team, &job).await {
                                Ok(()) => {
                                    let applied = self
                                        .repository
                                        .transition_if_status(
                                            job.id,
                                            JobStatus::Pending,
                                            JobStatus::Ready,
                                            TransitionFields::computed_at(self.clock.now()),
                                        )
                                        .await?;
                                    if applied {
                                        self.bus.publish(job.id, JobStatus::Ready).await?;
                                    }
                                }
                                Err(err) => {
                                    let applied = self
                                        .repository
                                        .transition_if_status(
                                            job.id,
                                            JobStatus::Pending,
                                            JobStatus::Failed,
                                            TransitionFields::error(err.to_string()),
                                        )
                                        .await?;
                                    if applied {
                                        self.bus.publish(job.id, JobStatus::Failed).await?;
                                    }
                                    if self.classifier.is_non_retryable(&err) {
                                        warn!("job {} failed non-retryably: {err}", job.id);
                                        errors.push(ExecuteFailure {
                                            kind: FailureKind::NonRetryable,
                                            job_id: Some(job.id),
                                            message: err.to_string(),
                                        });
                                        return Ok(ExecuteOutcome::failed(errors));
                                    }
                                    failures += 1;
                                    warn!(
                                        "job {} failed ({failures}/{} retries used): {err}",
                                        job.id, self.config.max_retries
                                    );
                                    errors.push(ExecuteFailure {
                                        kind: FailureKind::Retryable,
                                        job_id: Some(job.id),
                                        message: err.to_string(),
                                    });
                                    if failures > self.config.max_retries {
                                        errors.push(ExecuteFailure {
                                            kind: FailureKind::RetryBudgetExhausted,
                                            job_id: None,
                                            message: format!(
                                                "{failures} compute failures exceeded the budget of {}",
                                                self.config.max_retries
                                            ),
                                        });
                                        return Ok(ExecuteOutcome::failed(errors));
                                    }
                                }
                            }
                            progressed = true;
                        }
                    }
                }
                if progressed {
                    backoff = self.config.backoff_initial;
                    continue;
                }
            }

            if pending.is_empty() && missing.is_empty() {
                // Coverage complete; resolve any racy overlap on the way out.
                let final_jobs = self
                    .repository
                    .find_existing(team, &query_hash, range)
                    .await?;
                let fresh = filter_by_freshness(final_jobs, schedule, self.clock.now());
                let ready: Vec<Job> = fresh
                    .into_iter()
                    .filter(|job| job.status == JobStatus::Ready)
                    .collect();
                let covering = filter_overlapping_jobs(ready);
                return Ok(ExecuteOutcome {
                    ready: true,
                    job_ids: covering.iter().map(|job| job.id).collect(),
                    errors,
                });
            }

            // Peers own the outstanding ranges; subscribe, reclaim the dead,
            // and wait.
            let new_ids: Vec<JobId> = pending
                .iter()
                .map(|job| job.id)
                .filter(|id| !subscribed.contains(id))
                .collect();
            match subscription.as_mut() {
                None => subscription = Some(self.bus.subscribe(&new_ids).await?),
                Some(handle) if !new_ids.is_empty() => handle.extend(&new_ids).await?,
                Some(_) => {}
            }
            subscribed.extend(new_ids);

            for job in &pending {
                let stale = self
                    .prober
                    .is_stale(
                        job,
                        now,
                        self.config.grace_period,
                        self.config.stale_threshold,
                    )
                    .await?;
                if !stale {
                    continue;
                }
                let applied = self
                    .repository
                    .transition_if_status(
                        job.id,
                        JobStatus::Pending,
                        JobStatus::Failed,
                        TransitionFields::error("reclaimed: owning computation presumed dead"),
                    )
                    .await?;
                if applied {
                    warn!("reclaimed stale job {} covering {}", job.id, job.range);
                    self.bus.publish(job.id, JobStatus::Failed).await?;
                }
            }

            let remaining = (deadline - self.clock.now()).to_std().unwrap_or_default();
            if let Some(handle) = subscription.as_mut() {
                let woke = handle.wait(backoff.min(remaining)).await?;
                if let Some(notification) = woke {
                    debug!(
                        "woken by job {} -> {}",
                        notification.job_id, notification.status
                    );
                }
            }
            backoff = backoff.saturating_mul(2).min(self.config.backoff_cap);
        }
    }
}
