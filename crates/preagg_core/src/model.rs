use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, TeamId};

/// Half-open datetime interval `[start, end)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Full containment, not mere overlap.
    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Ready,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Ready | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// One promise/result of materializing a bounded time range for one query
/// fingerprint. Created `Pending` by whichever caller wins the creation race,
/// transitions exactly once to `Ready` or `Failed`, and is never deleted by
/// this subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub team_id: TeamId,
    pub query_hash: String,
    pub range: TimeRange,
    pub status: JobStatus,
    pub expires_at: DateTime<Utc>,
    pub computed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Broadcast on a job's channel when a terminal transition is applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Column values carried by a conditional status transition.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransitionFields {
    pub computed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TransitionFields {
    pub fn computed_at(at: DateTime<Utc>) -> Self {
        Self {
            computed_at: Some(at),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            computed_at: None,
            error: Some(message.into()),
        }
    }
}
