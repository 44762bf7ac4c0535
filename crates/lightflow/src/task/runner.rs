//! End-to-end execution of one task job
//!
//! For a reserved task job the runner resolves the definition, materializes
//! the body-facing data view, invokes the body with retries per policy, and
//! publishes the terminal signal. The caller acks the job only after the
//! runner returns, so the completion signal is always on the bus before the
//! broker forgets the job.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::body::run_command;
use super::context::{SignalHandle, TaskContext};
use super::outcome::{TaskError, TaskOutcome};
use crate::data::Envelope;
use crate::engine::Engine;
use crate::queue::{JobPayload, JobRecord};
use crate::reliability::RetryDecision;
use crate::signal::{Signal, SignalBus, SignalKind, SignalScope};
use crate::spec::{BodyKind, TaskNode};
use crate::store::{Section, StoreHandle};

/// Executes task jobs against the engine's handles
pub struct TaskRunner {
    engine: Arc<Engine>,
}

impl TaskRunner {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run one task job to its terminal signal
    ///
    /// Returns `Ok` once the terminal signal is published — including for
    /// task failures, which are a normal outcome at this level. `Err` means
    /// the runtime itself could not make progress and the job should be
    /// redelivered.
    #[instrument(skip(self, record), fields(job = %record.label(), run_id = %record.run_id))]
    pub async fn run(&self, record: &JobRecord) -> Result<(), TaskError> {
        let JobPayload::Task {
            dag,
            task,
            envelope,
        } = &record.payload
        else {
            return Err(TaskError::fatal(
                "dispatch",
                format!("task runner received a {} job", record.queue()),
            ));
        };

        let node = match self.resolve(record, dag, task) {
            Ok(node) => node,
            Err(err) => {
                // Definition mismatch is permanent; fail the task, not the worker
                self.publish_failed(record, dag, task, &err).await?;
                return Ok(());
            }
        };

        let view = match envelope.select(
            node.inputs.as_deref(),
            &node.aliases,
            node.inputs.is_some(),
        ) {
            Ok(view) => view,
            Err(err) => {
                let err = TaskError::from(err);
                self.publish_failed(record, dag, task, &err).await?;
                return Ok(());
            }
        };

        let signals = SignalHandle::new(Arc::clone(&self.engine.bus), record.run_id);
        let watcher = signals.watch(dag.clone());
        let store = StoreHandle::new(Arc::clone(&self.engine.store), record.run_id);

        // Delivery attempts (broker redeliveries) count against the same
        // budget as in-place retries
        let mut attempt = record.attempt.max(1);
        let result = loop {
            let ctx = TaskContext {
                run_id: record.run_id,
                dag: dag.clone(),
                task: task.clone(),
                attempt,
                data: view.clone(),
                input: envelope.clone(),
                store: store.clone(),
                signals: signals.clone(),
            };

            match self.invoke(&node, ctx).await {
                Ok(outcome) => break Ok(outcome),
                Err(err) => match node.retry.decide(attempt, err.is_recoverable()) {
                    RetryDecision::Retry { delay } => {
                        attempt += 1;
                        warn!(
                            task = %task,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "task body failed, retrying: {err}"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => break Err(err),
                },
            }
        };
        watcher.abort();

        // Bookkeeping writes are best-effort: an archived document (aborted
        // run) must not turn a finished task into a worker error
        let section = Section::task(dag, task);
        let _ = store.set(&section, "attempts", json!(attempt)).await;

        match result {
            Ok(outcome) => {
                let _ = store.set(&section, "state", json!("succeeded")).await;
                self.publish_outcome(record, dag, task, outcome).await
            }
            Err(err) => {
                let _ = store.set(&section, "state", json!("failed")).await;
                self.publish_failed(record, dag, task, &err).await?;
                Ok(())
            }
        }
    }

    fn resolve(&self, record: &JobRecord, dag: &str, task: &str) -> Result<TaskNode, TaskError> {
        Ok(self
            .engine
            .library
            .get(&record.workflow)?
            .dag(dag)?
            .task(task)?
            .clone())
    }

    async fn invoke(&self, node: &TaskNode, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        let fut = async {
            match &node.body {
                BodyKind::Script { handler } => {
                    let handler = self
                        .engine
                        .bodies
                        .get(handler)
                        .ok_or_else(|| TaskError::HandlerNotFound(handler.clone()))?;
                    handler(ctx).await
                }
                BodyKind::Command { program, args, env } => {
                    run_command(program, args, env, node, &ctx).await
                }
            }
        };

        match node.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| TaskError::Deadline(deadline))?,
            None => fut.await,
        }
    }

    async fn publish_outcome(
        &self,
        record: &JobRecord,
        dag: &str,
        task: &str,
        outcome: TaskOutcome,
    ) -> Result<(), TaskError> {
        let run_id = record.run_id;
        match outcome {
            TaskOutcome::Success { output, routing } => {
                let output = stamped(output, task);
                info!(task, slices = output.len(), "task completed");
                self.engine
                    .bus
                    .publish(Signal::task_completed(run_id, dag, task, output, routing))
                    .await?;
            }
            TaskOutcome::SuccessStopDag { output } => {
                let output = stamped(output, task);
                info!(task, "task completed, stopping dag");
                let mut signal =
                    Signal::task_completed(run_id, dag, task, output, Default::default());
                if let SignalKind::TaskCompleted { stop_dag, .. } = &mut signal.kind {
                    *stop_dag = true;
                }
                self.engine.bus.publish(signal).await?;
            }
            TaskOutcome::SuccessStopWorkflow { output } => {
                let output = stamped(output, task);
                info!(task, "task completed, requesting workflow stop");
                self.engine
                    .bus
                    .publish(Signal::task_completed(
                        run_id,
                        dag,
                        task,
                        output,
                        Default::default(),
                    ))
                    .await?;
                self.engine
                    .bus
                    .publish(Signal::stop(run_id, SignalScope::Workflow))
                    .await?;
            }
            TaskOutcome::AbortWorkflow => {
                warn!(task, "task requested workflow abort");
                self.engine
                    .bus
                    .publish(Signal::abort(run_id, SignalScope::Workflow))
                    .await?;
            }
        }
        Ok(())
    }

    async fn publish_failed(
        &self,
        record: &JobRecord,
        dag: &str,
        task: &str,
        err: &TaskError,
    ) -> Result<(), TaskError> {
        warn!(task, kind = err.kind(), "task failed: {err}");
        self.engine
            .bus
            .publish(Signal::task_failed(
                record.run_id,
                dag,
                task,
                err.kind(),
                err.to_string(),
            ))
            .await?;
        Ok(())
    }
}

/// Ensure the emitting task appears in every output slice's history
fn stamped(mut output: Envelope, task: &str) -> Envelope {
    output.append_history(task);
    debug!(task, slots = ?output.slots(), "stamped output envelope");
    output
}
