use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::broadcast;
use tokio::time::Instant;

use preagg_core::{JobId, JobNotification, JobStatus, NotificationBus, PreaggResult, Subscription};

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// In-process notification fan-out over a tokio broadcast channel.
/// Subscribers filter the shared stream down to the job ids they care
/// about; `wait` timing out is a normal outcome that callers answer
/// with a repository poll.
pub struct BroadcastBus {
    sender: broadcast::Sender<JobNotification>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBus for BroadcastBus {
    async fn publish(&self, job_id: JobId, status: JobStatus) -> PreaggResult<()> {
        // Err here only means no subscriber is listening right now.
        let _ = self.sender.send(JobNotification { job_id, status });
        Ok(())
    }

    async fn subscribe(&self, job_ids: &[JobId]) -> PreaggResult<Box<dyn Subscription>> {
        Ok(Box::new(BroadcastSubscription {
            receiver: self.sender.subscribe(),
            job_ids: job_ids.iter().copied().collect(),
        }))
    }
}

pub struct BroadcastSubscription {
    receiver: broadcast::Receiver<JobNotification>,
    job_ids: HashSet<JobId>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn extend(&mut self, job_ids: &[JobId]) -> PreaggResult<()> {
        self.job_ids.extend(job_ids.iter().copied());
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> PreaggResult<Option<JobNotification>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.receiver.recv()).await {
                Ok(Ok(notification)) => {
                    if self.job_ids.contains(&notification.job_id) {
                        return Ok(Some(notification));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    // Missed notifications degrade to the polling path.
                    warn!("notification subscriber lagged by {skipped} messages");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }
}
