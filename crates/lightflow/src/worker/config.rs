//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueName;
use crate::sched::DagPolicy;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Queues this worker services
    pub queues: Vec<QueueName>,

    /// Maximum concurrent job executions
    pub concurrency: usize,

    /// Attempt budget per job before it dead-letters
    pub max_job_attempts: u32,

    /// How long one reserve call waits for a job
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Lease renewal interval for in-flight jobs
    #[serde(with = "duration_millis")]
    pub lease_renew_interval: Duration,

    /// Expired-lease reclamation sweep interval
    #[serde(with = "duration_millis")]
    pub reclaim_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Failure policy handed to the DAG scheduler
    #[serde(skip, default)]
    pub dag_policy: DagPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: QueueName::ALL.to_vec(),
            concurrency: 4,
            max_job_attempts: 3,
            poll_interval: Duration::from_millis(500),
            lease_renew_interval: Duration::from_secs(10),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            dag_policy: DagPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create a configuration servicing the given queues
    pub fn new(queues: Vec<QueueName>) -> Self {
        Self {
            queues,
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the per-job attempt budget
    pub fn with_max_job_attempts(mut self, attempts: u32) -> Self {
        self.max_job_attempts = attempts.max(1);
        self
    }

    /// Set the reserve poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the DAG failure policy
    pub fn with_dag_policy(mut self, policy: DagPolicy) -> Self {
        self.dag_policy = policy;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(!config.worker_id.is_empty());
        assert_eq!(config.queues, QueueName::ALL.to_vec());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_job_attempts, 3);
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerConfig::new(vec![QueueName::Task])
            .with_worker_id("test-worker")
            .with_concurrency(8)
            .with_max_job_attempts(5);

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.queues, vec![QueueName::Task]);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.max_job_attempts, 5);
    }

    #[test]
    fn test_concurrency_floor() {
        let config = WorkerConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }
}
