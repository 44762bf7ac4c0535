//! Broker trait and the in-process reference implementation
//!
//! The concrete broker client is an external collaborator; everything in
//! the engine talks to [`JobQueue`]. Guarantees: at-least-once delivery,
//! lease-based ownership, no FIFO promise across consumers.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{JobRecord, QueueName};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Lease token does not match a leased job (expired or already settled)
    #[error("unknown lease for job {0}")]
    UnknownLease(Uuid),

    /// Broker unreachable or failing
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Proof of ownership of one reserved job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub job_id: Uuid,
    token: Uuid,
}

/// A reserved job plus the token needed to settle it
#[derive(Debug)]
pub struct Lease {
    pub record: JobRecord,
    pub token: LeaseToken,
}

/// A job that exhausted its attempt budget
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub record: JobRecord,
    pub reason: String,
}

/// Submit/consume typed jobs on named queues with ack semantics
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Durable append; returns the job id
    async fn submit(&self, record: JobRecord) -> Result<Uuid, QueueError>;

    /// Pull the next job matching any of the listed queues
    ///
    /// Waits up to `wait` for a job to appear; `None` on poll timeout.
    async fn reserve(
        &self,
        queues: &[QueueName],
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Lease>, QueueError>;

    /// Acknowledge successful processing; the job is gone
    async fn ack(&self, token: LeaseToken) -> Result<(), QueueError>;

    /// Give the job back; `requeue` makes it visible to another consumer,
    /// otherwise it lands in the dead-letter buffer
    async fn nack(&self, token: LeaseToken, requeue: bool, reason: &str)
        -> Result<(), QueueError>;

    /// Renew the lease on an in-flight job
    async fn extend_lease(&self, token: &LeaseToken) -> Result<(), QueueError>;

    /// Re-queue jobs whose lease expired; returns their ids
    async fn reclaim_expired(&self) -> Result<Vec<Uuid>, QueueError>;

    /// Jobs that exhausted their attempt budget
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError>;

    /// Number of visible (unleased) jobs on a queue
    async fn depth(&self, queue: QueueName) -> Result<usize, QueueError>;
}

struct LeasedJob {
    record: JobRecord,
    worker_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, VecDeque<JobRecord>>,
    leased: HashMap<Uuid, LeasedJob>,
    dead: Vec<DeadLetter>,
}

/// In-process broker
///
/// Reference implementation of [`JobQueue`] with the same semantics a
/// remote broker client must provide: lease tokens, visibility timeout,
/// dead letters. Single-process only.
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    lease_ttl: Duration,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            lease_ttl: Duration::from_secs(30),
        }
    }

    /// Set the visibility timeout for reserved jobs
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    fn try_reserve(&self, queues: &[QueueName], worker_id: &str) -> Option<Lease> {
        let mut state = self.state.lock();
        for queue in queues {
            if let Some(mut record) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                record.attempt += 1;
                let token = LeaseToken {
                    job_id: record.id,
                    token: Uuid::now_v7(),
                };
                state.leased.insert(
                    token.token,
                    LeasedJob {
                        record: record.clone(),
                        worker_id: worker_id.to_string(),
                        deadline: Instant::now() + self.lease_ttl,
                    },
                );
                return Some(Lease { record, token });
            }
        }
        None
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryBroker {
    async fn submit(&self, record: JobRecord) -> Result<Uuid, QueueError> {
        let id = record.id;
        let queue = record.queue();
        debug!(job = %record.label(), %queue, "submitting job");
        self.state
            .lock()
            .queues
            .entry(queue)
            .or_default()
            .push_back(record);
        self.notify.notify_one();
        Ok(id)
    }

    async fn reserve(
        &self,
        queues: &[QueueName],
        worker_id: &str,
        wait: Duration,
    ) -> Result<Option<Lease>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lease) = self.try_reserve(queues, worker_id) {
                return Ok(Some(lease));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // notify_one stores a permit, so a submit racing this gap is
            // not lost
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, token: LeaseToken) -> Result<(), QueueError> {
        self.state
            .lock()
            .leased
            .remove(&token.token)
            .map(|_| ())
            .ok_or(QueueError::UnknownLease(token.job_id))
    }

    async fn nack(
        &self,
        token: LeaseToken,
        requeue: bool,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let leased = state
            .leased
            .remove(&token.token)
            .ok_or(QueueError::UnknownLease(token.job_id))?;

        if requeue {
            debug!(job = %leased.record.label(), reason, "nack, requeueing");
            state
                .queues
                .entry(leased.record.queue())
                .or_default()
                .push_back(leased.record);
            drop(state);
            self.notify.notify_one();
        } else {
            warn!(job = %leased.record.label(), reason, "nack, dead-lettering");
            state.dead.push(DeadLetter {
                record: leased.record,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    async fn extend_lease(&self, token: &LeaseToken) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let leased = state
            .leased
            .get_mut(&token.token)
            .ok_or(QueueError::UnknownLease(token.job_id))?;
        leased.deadline = Instant::now() + self.lease_ttl;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<Vec<Uuid>, QueueError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<Uuid> = state
            .leased
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(&t, _)| t)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for token in expired {
            if let Some(leased) = state.leased.remove(&token) {
                warn!(
                    job = %leased.record.label(),
                    worker = %leased.worker_id,
                    "lease expired, requeueing"
                );
                reclaimed.push(leased.record.id);
                state
                    .queues
                    .entry(leased.record.queue())
                    .or_default()
                    .push_back(leased.record);
            }
        }
        if !reclaimed.is_empty() {
            drop(state);
            self.notify.notify_one();
        }
        Ok(reclaimed)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        Ok(self.state.lock().dead.clone())
    }

    async fn depth(&self, queue: QueueName) -> Result<usize, QueueError> {
        Ok(self
            .state
            .lock()
            .queues
            .get(&queue)
            .map_or(0, VecDeque::len))
    }
}
