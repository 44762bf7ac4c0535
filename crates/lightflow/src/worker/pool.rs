//! The worker: job consumption, dispatch and graceful shutdown
//!
//! A worker services a queue subset. Each reserved job is dispatched to
//! the matching component — workflow scheduler, DAG scheduler or task
//! runner — under a concurrency semaphore, with a lease-renewal ticker
//! keeping the broker from reclaiming in-flight work. Shutdown is
//! co-operative: stop reserving, drain, deadline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::queue::{JobQueue, Lease, QueueError, QueueName};
use crate::sched::{DagScheduler, WorkflowScheduler};
use crate::signal::{QueryTarget, Signal, SignalBus, SignalKind, CONTROL_CHANNEL};
use crate::task::TaskRunner;

use super::config::WorkerConfig;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Running and reserving jobs
    Running,
    /// Draining: in-flight jobs finish, nothing new is reserved
    Draining,
    /// Stopped
    Stopped,
}

/// Error type for the worker loop
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Graceful shutdown timed out with jobs still in flight
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// A worker consuming jobs for a set of queues
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new(engine, WorkerConfig::new(vec![QueueName::Task]));
/// worker.start().await?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct Worker {
    engine: Arc<Engine>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    slots: Arc<Semaphore>,
    active_jobs: Arc<Mutex<HashSet<Uuid>>>,
    loop_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(engine: Arc<Engine>, config: WorkerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            slots: Arc::new(Semaphore::new(config.concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Stopped),
            active_jobs: Arc::new(Mutex::new(HashSet::new())),
            loop_handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the consume, reclaim and introspection loops
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Running {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "starting worker"
        );

        // Workers answer introspection queries on the control channel
        self.engine
            .bus
            .open(CONTROL_CHANNEL)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        let mut handles = self.loop_handles.lock();
        handles.push(self.spawn_consume_loop());
        handles.push(self.spawn_reclaim_loop());
        handles.push(self.spawn_query_loop());
        Ok(())
    }

    /// Graceful shutdown: stop reserving, drain in-flight jobs
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        if *self.status.read() == WorkerStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        *self.status.write() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.slots.available_permits() == self.config.concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.config.concurrency - self.slots.available_permits(),
                    "shutdown timeout reached"
                );
                *self.status.write() = WorkerStatus::Stopped;
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for handle in self.loop_handles.lock().drain(..) {
            handle.abort();
        }
        *self.status.write() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker stopped");
        Ok(())
    }

    /// Current lifecycle status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Number of jobs currently executing
    pub fn in_flight(&self) -> usize {
        self.config.concurrency - self.slots.available_permits()
    }

    /// The worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn spawn_consume_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let config = self.config.clone();
        let slots = Arc::clone(&self.slots);
        let active_jobs = Arc::clone(&self.active_jobs);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                // Hold a slot before reserving so a reserved job always has
                // capacity to run
                let permit = tokio::select! {
                    permit = Arc::clone(&slots).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    _ = shutdown_rx.changed() => break,
                };

                let reserved = tokio::select! {
                    reserved = engine.queue.reserve(
                        &config.queues,
                        &config.worker_id,
                        config.poll_interval,
                    ) => reserved,
                    _ = shutdown_rx.changed() => {
                        drop(permit);
                        break;
                    }
                };

                let lease = match reserved {
                    Ok(Some(lease)) => lease,
                    Ok(None) => {
                        drop(permit);
                        continue;
                    }
                    Err(err) => {
                        error!("reserve failed: {err}");
                        drop(permit);
                        tokio::time::sleep(config.poll_interval).await;
                        continue;
                    }
                };

                let engine = Arc::clone(&engine);
                let config = config.clone();
                let active_jobs = Arc::clone(&active_jobs);
                tokio::spawn(async move {
                    let job_id = lease.record.id;
                    active_jobs.lock().insert(job_id);
                    handle_job(engine, &config, lease).await;
                    active_jobs.lock().remove(&job_id);
                    drop(permit);
                });
            }
            debug!("consume loop exited");
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let interval = self.config.reclaim_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.queue.reclaim_expired().await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "reclaimed expired leases");
                            }
                            Ok(_) => {}
                            Err(err) => error!("lease reclamation failed: {err}"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("reclaim loop exited");
        })
    }

    fn spawn_query_loop(&self) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let worker_id = self.config.worker_id.clone();
        let queues = self.config.queues.clone();
        let active_jobs = Arc::clone(&self.active_jobs);
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut stream = engine.bus.subscribe(CONTROL_CHANNEL).await;
            loop {
                let signal = tokio::select! {
                    signal = stream.recv() => signal,
                    _ = shutdown_rx.changed() => break,
                };
                let Some(signal) = signal else { break };

                match signal.kind {
                    SignalKind::Query {
                        target: QueryTarget::Workers,
                    } => {
                        let Some(correlation) = signal.correlation_id else {
                            continue;
                        };
                        let jobs: Vec<String> = active_jobs
                            .lock()
                            .iter()
                            .map(|id| id.to_string())
                            .collect();
                        let body = json!({
                            "worker_id": worker_id,
                            "queues": queues,
                            "active_jobs": jobs,
                        });
                        if let Err(err) = engine
                            .bus
                            .publish(Signal::query_reply(CONTROL_CHANNEL, correlation, body))
                            .await
                        {
                            warn!("worker query reply failed: {err}");
                        }
                    }
                    // A stop broadcast on the control channel drains this
                    // worker; its own process still calls shutdown()
                    SignalKind::StopRequest { .. } => {
                        info!(worker_id = %worker_id, "stop broadcast received, draining");
                        let _ = shutdown_tx.send(true);
                    }
                    _ => {}
                }
            }
            debug!("query loop exited");
        })
    }
}

/// Dispatch a reserved job and settle its lease
async fn handle_job(engine: Arc<Engine>, config: &WorkerConfig, lease: Lease) {
    let record = lease.record;
    let token = lease.token;
    debug!(job = %record.label(), attempt = record.attempt, "dispatching job");

    // Renew the lease while the job runs
    let renewal = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        let interval = config.lease_renew_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(err) = engine.queue.extend_lease(&token).await {
                    debug!("lease renewal stopped: {err}");
                    break;
                }
            }
        })
    };

    let result: Result<(), String> = match record.queue() {
        QueueName::Workflow => WorkflowScheduler::new(Arc::clone(&engine))
            .run(&record)
            .await
            .map_err(|e| e.to_string()),
        QueueName::Dag => DagScheduler::new(Arc::clone(&engine))
            .with_policy(config.dag_policy)
            .run(&record)
            .await
            .map_err(|e| e.to_string()),
        QueueName::Task => TaskRunner::new(Arc::clone(&engine))
            .run(&record)
            .await
            .map_err(|e| e.to_string()),
    };
    renewal.abort();

    match result {
        Ok(()) => {
            if let Err(err) = engine.queue.ack(token).await {
                // Lease may have expired mid-run; the job will re-run
                warn!(job = %record.label(), "ack failed: {err}");
            }
        }
        Err(reason) => {
            let requeue = record.attempt < config.max_job_attempts;
            error!(
                job = %record.label(),
                attempt = record.attempt,
                requeue,
                "job failed: {reason}"
            );
            if !requeue {
                surface_exhausted_job(&engine, &record, &reason).await;
            }
            if let Err(err) = engine.queue.nack(token, requeue, &reason).await {
                warn!(job = %record.label(), "nack failed: {err}");
            }
        }
    }
}

/// Publish the final `*-failed` signal for a job leaving the queue for the
/// dead-letter buffer
async fn surface_exhausted_job(engine: &Engine, record: &crate::queue::JobRecord, reason: &str) {
    use crate::queue::JobPayload;

    let signal = match &record.payload {
        JobPayload::Task { dag, task, .. } => Some(Signal::task_failed(
            record.run_id,
            dag.clone(),
            task.clone(),
            "job_attempts_exhausted",
            reason,
        )),
        JobPayload::Dag { dag, .. } => Some(Signal::new(
            record.run_id,
            SignalKind::DagFailed {
                dag: dag.clone(),
                aborted: false,
                first_failure: None,
            },
        )),
        JobPayload::Workflow { .. } => None,
    };

    if let Some(signal) = signal {
        if let Err(err) = engine.bus.publish(signal).await {
            warn!("failed to surface dead-lettered job: {err}");
        }
    }
}
