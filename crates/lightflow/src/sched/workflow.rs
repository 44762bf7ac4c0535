//! Workflow scheduler: run lifecycle over a set of DAG jobs
//!
//! A workflow job creates the run document, opens the signal channel,
//! enqueues one DAG job per autostart DAG, and then lives on the bus:
//! launching run-dag requests, tracking terminal DAG signals, honoring
//! stop/abort, answering status queries. When the live set empties it
//! finalizes the run and closes the channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::queue::{JobPayload, JobQueue, JobRecord, QueueError};
use crate::signal::{
    FailureSummary, QueryTarget, Signal, SignalBus, SignalError, SignalKind, SignalScope,
};
use crate::spec::SpecError;
use crate::store::{DocumentStore, RunState, Section, StoreError};

/// Error type for both schedulers
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A job of the wrong kind reached this scheduler
    #[error("bad job dispatch: {0}")]
    BadJob(String),

    /// Status lookup for a run the store has never seen
    #[error("unknown run: {0}")]
    UnknownRun(Uuid),
}

/// Validate and enqueue a workflow start request
///
/// Validation runs before anything touches the broker: an invalid
/// definition never enqueues a job. Returns the new run id; every
/// submission gets a fresh one.
pub async fn submit_workflow(
    engine: &Engine,
    workflow: &str,
    params: serde_json::Value,
) -> Result<Uuid, SchedulerError> {
    let def = engine.library.get(workflow)?;
    def.validate()?;

    let run_id = Uuid::now_v7();
    // Open the channel at submission so callers can subscribe before the
    // workflow job is picked up
    engine.bus.open(run_id).await?;
    engine
        .queue
        .submit(JobRecord::new(
            run_id,
            workflow,
            JobPayload::Workflow { params },
        ))
        .await?;

    info!(%run_id, workflow, "workflow submitted");
    Ok(run_id)
}

/// Publish a co-operative stop for a run
pub async fn stop_run(engine: &Engine, run_id: Uuid) -> Result<(), SchedulerError> {
    engine
        .bus
        .publish(Signal::stop(run_id, SignalScope::Workflow))
        .await?;
    Ok(())
}

/// Publish an abort for a run
pub async fn abort_run(engine: &Engine, run_id: Uuid) -> Result<(), SchedulerError> {
    engine
        .bus
        .publish(Signal::abort(run_id, SignalScope::Workflow))
        .await?;
    Ok(())
}

/// A run status snapshot, live (via query) or from the archived document
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub workflow: Option<String>,
    pub state: Option<RunState>,
    pub live_dags: Vec<String>,
}

/// Query a run's status over the bus, falling back to the store
///
/// A live run answers on its signal channel. A finished run has no
/// channel, so the archived document's terminal metadata answers instead.
pub async fn run_status(
    engine: &Engine,
    run_id: Uuid,
    timeout: Duration,
) -> Result<RunStatus, SchedulerError> {
    match engine
        .bus
        .request(Signal::query(run_id, QueryTarget::Run), timeout)
        .await
    {
        Ok(reply) => {
            let SignalKind::QueryReply { body } = reply.kind else {
                return Err(SchedulerError::UnknownRun(run_id));
            };
            Ok(RunStatus {
                run_id,
                workflow: body["workflow"].as_str().map(str::to_string),
                state: serde_json::from_value(body["state"].clone()).ok(),
                live_dags: body["live_dags"]
                    .as_array()
                    .map(|dags| {
                        dags.iter()
                            .filter_map(|d| d.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
        }
        Err(SignalError::ChannelClosed(_)) | Err(SignalError::Timeout(_)) => {
            let state = engine
                .store
                .get(run_id, &Section::Meta, "state")
                .await
                .map_err(|_| SchedulerError::UnknownRun(run_id))?
                .and_then(|v| serde_json::from_value(v).ok());
            let workflow = engine
                .store
                .get(run_id, &Section::Meta, "workflow")
                .await
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_string));
            Ok(RunStatus {
                run_id,
                workflow,
                state,
                live_dags: Vec::new(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Drives one workflow job from start to its terminal state
pub struct WorkflowScheduler {
    engine: Arc<Engine>,
}

impl WorkflowScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Run one workflow job to termination
    #[instrument(skip(self, record), fields(job = %record.label(), run_id = %record.run_id))]
    pub async fn run(&self, record: &JobRecord) -> Result<(), SchedulerError> {
        let JobPayload::Workflow { params } = &record.payload else {
            return Err(SchedulerError::BadJob(format!(
                "workflow scheduler received a {} job",
                record.queue()
            )));
        };

        let run_id = record.run_id;
        let def = self.engine.library.get(&record.workflow)?.clone();

        self.engine.store.create_doc(run_id).await?;
        self.engine.bus.open(run_id).await?;

        let meta = Section::Meta;
        self.engine
            .store
            .set(run_id, &meta, "workflow", json!(def.name))
            .await?;
        self.engine
            .store
            .set(run_id, &meta, "params", params.clone())
            .await?;
        self.engine
            .store
            .set(run_id, &meta, "started_at", json!(Utc::now()))
            .await?;
        self.set_state(run_id, RunState::Running).await?;

        // Subscribe before enqueueing so no dag terminal signal is missed
        let mut stream = self.engine.bus.subscribe(run_id).await;

        let mut live: HashSet<String> = HashSet::new();
        for dag in def.autostart_dags() {
            self.enqueue_dag(record, &dag.name, None).await?;
            live.insert(dag.name.clone());
        }
        info!(workflow = %def.name, dags = live.len(), "workflow started");

        let mut stopping = false;
        let mut aborted = false;
        let mut first_failure: Option<FailureSummary> = None;

        while !live.is_empty() {
            let Some(signal) = stream.recv().await else {
                warn!("signal channel closed mid-run, exiting");
                return Ok(());
            };

            match signal.kind {
                SignalKind::RunDag { ref dag, ref seed } => {
                    if stopping {
                        debug!(dag = %dag, "run-dag ignored, run is stopping");
                        continue;
                    }
                    if def.dag(dag).is_err() {
                        warn!(dag = %dag, "run-dag for unknown dag ignored");
                        continue;
                    }
                    if !live.insert(dag.clone()) {
                        warn!(dag = %dag, "run-dag ignored, dag already live");
                        continue;
                    }
                    info!(dag = %dag, "launching dag on request");
                    self.enqueue_dag(record, dag, seed.clone()).await?;
                }
                SignalKind::DagCompleted { ref dag, stopped } => {
                    debug!(dag = %dag, stopped, "dag completed");
                    live.remove(dag);
                }
                SignalKind::DagFailed {
                    ref dag,
                    aborted: dag_aborted,
                    first_failure: ref failure,
                } => {
                    warn!(dag = %dag, aborted = dag_aborted, "dag failed");
                    live.remove(dag);
                    if first_failure.is_none() {
                        first_failure = failure.clone().or_else(|| {
                            Some(FailureSummary {
                                dag: dag.clone(),
                                task: String::new(),
                                kind: if dag_aborted { "aborted" } else { "dag_failed" }
                                    .to_string(),
                            })
                        });
                    }
                    // Strict workflow policy: one failed dag stops the rest
                    if !stopping && !live.is_empty() {
                        stopping = true;
                        self.engine
                            .bus
                            .publish(Signal::stop(run_id, SignalScope::Workflow))
                            .await?;
                    }
                }
                SignalKind::StopRequest {
                    scope: SignalScope::Workflow,
                } => {
                    if !stopping {
                        info!("workflow stop requested, draining live dags");
                        stopping = true;
                        self.set_state(run_id, RunState::Stopping).await?;
                    }
                }
                SignalKind::AbortRequest {
                    scope: SignalScope::Workflow,
                } => {
                    warn!("workflow abort requested");
                    aborted = true;
                    // DAG schedulers see the same broadcast and reply with
                    // dag-failed(aborted) without draining
                }
                SignalKind::Query {
                    target: QueryTarget::Run,
                } => {
                    if let Some(correlation) = signal.correlation_id {
                        let state = if aborted {
                            RunState::Aborted
                        } else if stopping {
                            RunState::Stopping
                        } else {
                            RunState::Running
                        };
                        let mut dags: Vec<&String> = live.iter().collect();
                        dags.sort();
                        let body = json!({
                            "workflow": def.name,
                            "state": state,
                            "live_dags": dags,
                        });
                        self.engine
                            .bus
                            .publish(Signal::query_reply(run_id, correlation, body))
                            .await?;
                    }
                }
                _ => {}
            }
        }

        let state = if aborted {
            RunState::Aborted
        } else if first_failure.is_some() {
            RunState::Failed
        } else if stopping {
            RunState::Stopped
        } else {
            RunState::Succeeded
        };
        self.finalize(run_id, state, first_failure).await
    }

    async fn enqueue_dag(
        &self,
        record: &JobRecord,
        dag: &str,
        seed: Option<crate::data::Envelope>,
    ) -> Result<(), SchedulerError> {
        self.engine
            .queue
            .submit(JobRecord::new(
                record.run_id,
                record.workflow.clone(),
                JobPayload::Dag {
                    dag: dag.to_string(),
                    seed,
                },
            ))
            .await?;
        Ok(())
    }

    async fn set_state(&self, run_id: Uuid, state: RunState) -> Result<(), SchedulerError> {
        self.engine
            .store
            .set(run_id, &Section::Meta, "state", json!(state))
            .await?;
        Ok(())
    }

    async fn finalize(
        &self,
        run_id: Uuid,
        state: RunState,
        first_failure: Option<FailureSummary>,
    ) -> Result<(), SchedulerError> {
        info!(%state, "workflow run finished");

        self.set_state(run_id, state).await?;
        self.engine
            .store
            .set(run_id, &Section::Meta, "finished_at", json!(Utc::now()))
            .await?;
        if let Some(failure) = &first_failure {
            self.engine
                .store
                .set(
                    run_id,
                    &Section::Meta,
                    "first_failure",
                    json!({
                        "dag": failure.dag,
                        "task": failure.task,
                        "kind": failure.kind,
                    }),
                )
                .await?;
        }

        self.engine
            .bus
            .publish(Signal::new(
                run_id,
                SignalKind::WorkflowCompleted {
                    state,
                    first_failure,
                },
            ))
            .await?;

        // Archive keeps terminal metadata readable for status lookups
        self.engine.store.archive_doc(run_id).await?;
        self.engine.bus.close(run_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DagSpec, WorkflowDef, WorkflowLibrary};
    use crate::task::BodyRegistry;

    fn engine_with(def: WorkflowDef) -> Arc<Engine> {
        let mut library = WorkflowLibrary::new();
        library.insert(def).unwrap();
        Engine::in_memory(library, BodyRegistry::new())
    }

    #[tokio::test]
    async fn test_submit_unknown_workflow() {
        let engine = engine_with(WorkflowDef::new("known").with_dag(DagSpec::new("main")));
        let err = submit_workflow(&engine, "ghost", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Spec(SpecError::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_enqueues_exactly_one_workflow_job() {
        let engine = engine_with(WorkflowDef::new("wf").with_dag(DagSpec::new("main")));
        submit_workflow(&engine, "wf", json!({"k": "v"}))
            .await
            .unwrap();

        assert_eq!(
            engine
                .queue
                .depth(crate::queue::QueueName::Workflow)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_two_submissions_get_distinct_runs() {
        let engine = engine_with(WorkflowDef::new("wf").with_dag(DagSpec::new("main")));
        let a = submit_workflow(&engine, "wf", json!({})).await.unwrap();
        let b = submit_workflow(&engine, "wf", json!({})).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds_immediately() {
        // A workflow whose only dag is non-autostart has nothing to run
        let engine =
            engine_with(WorkflowDef::new("wf").with_dag(DagSpec::new("side").manual_start()));
        let run_id = submit_workflow(&engine, "wf", json!({})).await.unwrap();

        let lease = engine
            .queue
            .reserve(
                &[crate::queue::QueueName::Workflow],
                "w1",
                Duration::from_millis(50),
            )
            .await
            .unwrap()
            .expect("workflow job");

        WorkflowScheduler::new(Arc::clone(&engine))
            .run(&lease.record)
            .await
            .unwrap();

        let status = run_status(&engine, run_id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(status.state, Some(RunState::Succeeded));
    }

    #[tokio::test]
    async fn test_status_for_unknown_run() {
        let engine = engine_with(WorkflowDef::new("wf").with_dag(DagSpec::new("main")));
        let err = run_status(&engine, Uuid::now_v7(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownRun(_)));
    }
}
