//! Lazy materialization coordinator: guarantees preaggregated results exist
//! for a requested time range, computing only the missing portions, with
//! mutual exclusion delegated to the job repository's uniqueness constraint.

pub mod api;
pub mod coordinator;
pub mod error;
pub mod fingerprint;
pub mod ids;
pub mod model;
pub mod time;
pub mod ttl;
pub mod windows;

pub use api::{
    CreateOutcome, ErrorClassifier, JobComputer, JobRepository, LivenessProber, NotificationBus,
    RetryAllClassifier, Subscription,
};
pub use coordinator::{
    Coordinator, CoordinatorConfig, ExecuteFailure, ExecuteOutcome, FailureKind,
};
pub use error::{PreaggError, PreaggResult};
pub use fingerprint::QueryInfo;
pub use ids::{Id, JobId, TeamId};
pub use model::{Job, JobNotification, JobStatus, TimeRange, TransitionFields};
pub use time::{Clock, ManualClock, SystemClock};
pub use ttl::{TtlRule, TtlSchedule, TtlSpec};
