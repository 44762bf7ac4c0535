//! DAG scheduler: dispatch ready tasks, await completions, route data
//!
//! The scheduler owns one DAG run: node states, pending-parent counters and
//! the per-node input accumulators. It blocks on the signal bus — never on
//! the job queue — while tasks execute elsewhere. Completion order on the
//! bus determines the dispatch order of newly-ready children.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::workflow::SchedulerError;
use crate::dag::{DagTopology, NodeState};
use crate::data::{Envelope, Routing};
use crate::engine::Engine;
use crate::queue::{JobPayload, JobQueue, JobRecord};
use crate::signal::{FailureSummary, Signal, SignalBus, SignalKind};
use crate::spec::DagSpec;
use crate::store::{DocumentStore, Section};

/// Failure handling policy for a DAG run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DagPolicy {
    /// A task failure fails the DAG: stop dispatching, drain in-flight work
    #[default]
    Strict,
    /// A task failure skips its dead descendants; the rest continues
    Lenient,
}

/// Mutable state of one DAG run
struct DagRun {
    run_id: Uuid,
    dag: String,
    topology: DagTopology,
    states: HashMap<String, NodeState>,
    /// Unresolved parents per node; a node becomes ready at zero
    counters: HashMap<String, usize>,
    /// Delivered parent envelopes, keyed by child
    accumulators: HashMap<String, Vec<(String, Envelope)>>,
    /// Nodes that became ready, in observation order
    ready_queue: VecDeque<String>,
    /// Stop dispatching new tasks; in-flight work drains
    draining: bool,
    /// The DAG was stopped (stop request or stop-dag outcome)
    stopped: bool,
    first_failure: Option<FailureSummary>,
}

impl DagRun {
    fn new(run_id: Uuid, dag: String, topology: DagTopology, seed: Option<Envelope>) -> Self {
        let mut states = HashMap::new();
        let mut counters = HashMap::new();
        let mut accumulators: HashMap<String, Vec<(String, Envelope)>> = HashMap::new();
        let mut ready_queue = VecDeque::new();

        for node in topology.nodes() {
            let in_degree = topology.in_degree(node);
            if in_degree == 0 {
                states.insert(node.clone(), NodeState::Ready);
                ready_queue.push_back(node.clone());
                if let Some(seed) = &seed {
                    accumulators
                        .entry(node.clone())
                        .or_default()
                        .push(("seed".to_string(), seed.fork()));
                }
            } else {
                states.insert(node.clone(), NodeState::Pending);
                counters.insert(node.clone(), in_degree);
            }
        }

        Self {
            run_id,
            dag,
            topology,
            states,
            counters,
            accumulators,
            ready_queue,
            draining: false,
            stopped: false,
            first_failure: None,
        }
    }

    fn state(&self, node: &str) -> NodeState {
        self.states.get(node).copied().unwrap_or(NodeState::Pending)
    }

    fn set_state(&mut self, node: &str, state: NodeState) {
        self.states.insert(node.to_string(), state);
    }

    /// Whether the run loop can terminate
    fn done(&self) -> bool {
        let running = self
            .states
            .values()
            .filter(|s| **s == NodeState::Running)
            .count();
        if self.draining {
            running == 0
        } else {
            running == 0
                && !self
                    .states
                    .values()
                    .any(|s| matches!(s, NodeState::Pending | NodeState::Ready))
        }
    }

    fn any_failed(&self) -> bool {
        self.states.values().any(|s| *s == NodeState::Failed)
    }

    /// Merged input envelope for a node, parents ordered as declared
    fn input_for(&mut self, node: &str) -> Envelope {
        let mut delivered = self.accumulators.remove(node).unwrap_or_default();

        let order: Vec<String> = self
            .topology
            .parents(node)
            .map(|e| e.parent.clone())
            .collect();
        delivered.sort_by_key(|(parent, _)| {
            order
                .iter()
                .position(|p| p == parent)
                .unwrap_or(usize::MAX)
        });

        if delivered.len() == 1 {
            // Single parent: no prefixing, envelope passes through intact
            delivered.remove(0).1
        } else {
            Envelope::merge(delivered)
        }
    }

    /// Decrement a child's pending-parent counter; ready at zero
    fn resolve_parent(&mut self, child: &str) {
        if let Some(counter) = self.counters.get_mut(child) {
            *counter = counter.saturating_sub(1);
            if *counter == 0 && self.state(child) == NodeState::Pending {
                self.set_state(child, NodeState::Ready);
                self.ready_queue.push_back(child.to_string());
            }
        }
    }

    /// Nodes currently non-live for skip propagation purposes
    fn non_live(&self) -> HashSet<String> {
        self.states
            .iter()
            .filter(|(_, s)| matches!(s, NodeState::Skipped | NodeState::Failed))
            .map(|(n, _)| n.clone())
            .collect()
    }
}

/// Drives one DAG job to its `dag-completed`/`dag-failed` signal
pub struct DagScheduler {
    engine: Arc<Engine>,
    policy: DagPolicy,
}

impl DagScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            policy: DagPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DagPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run one DAG job to termination
    #[instrument(skip(self, record), fields(job = %record.label(), run_id = %record.run_id))]
    pub async fn run(&self, record: &JobRecord) -> Result<(), SchedulerError> {
        let JobPayload::Dag { dag, seed } = &record.payload else {
            return Err(SchedulerError::BadJob(format!(
                "dag scheduler received a {} job",
                record.queue()
            )));
        };

        let spec = self.engine.library.get(&record.workflow)?.dag(dag)?.clone();
        let topology = spec.topology()?;

        // Subscribe before the first dispatch so no completion is missed
        let mut stream = self.engine.bus.subscribe(record.run_id).await;

        let mut run = DagRun::new(record.run_id, dag.clone(), topology, seed.clone());
        info!(
            dag = %run.dag,
            nodes = run.topology.nodes().len(),
            roots = run.ready_queue.len(),
            "starting dag run"
        );

        loop {
            if !run.draining {
                self.dispatch_ready(record, &spec, &mut run).await?;
            }
            if run.done() {
                break;
            }

            let Some(signal) = stream.recv().await else {
                // Channel closed under us: the run is being torn down and
                // nobody is listening for our terminal signal
                warn!(dag = %run.dag, "signal channel closed mid-run, exiting");
                return Ok(());
            };

            match signal.kind {
                SignalKind::TaskCompleted {
                    dag: ref sig_dag,
                    ref task,
                    ref output,
                    ref routing,
                    stop_dag,
                } if sig_dag == &run.dag => {
                    self.on_task_completed(&mut run, task, output, routing).await?;
                    if stop_dag {
                        info!(dag = %run.dag, task = %task, "task requested dag stop");
                        run.draining = true;
                        run.stopped = true;
                    }
                }
                SignalKind::TaskFailed {
                    dag: ref sig_dag,
                    ref task,
                    ref kind,
                    ..
                } if sig_dag == &run.dag => {
                    self.on_task_failed(&mut run, task, kind).await?;
                }
                SignalKind::TaskSkipped {
                    dag: ref sig_dag,
                    ref task,
                } if sig_dag == &run.dag => {
                    self.apply_skips(&mut run, vec![task.clone()]).await?;
                }
                SignalKind::StopRequest { ref scope } if scope.covers_dag(&run.dag) => {
                    info!(dag = %run.dag, "stop requested, draining");
                    run.draining = true;
                    run.stopped = true;
                }
                SignalKind::AbortRequest { ref scope } if scope.covers_dag(&run.dag) => {
                    warn!(dag = %run.dag, "abort requested, terminating without drain");
                    return self.finalize(&mut run, true).await;
                }
                _ => {}
            }
        }

        self.finalize(&mut run, false).await
    }

    /// Enqueue a task job for every ready node, in readiness order
    async fn dispatch_ready(
        &self,
        record: &JobRecord,
        spec: &DagSpec,
        run: &mut DagRun,
    ) -> Result<(), SchedulerError> {
        while let Some(node) = run.ready_queue.pop_front() {
            if run.state(&node) != NodeState::Ready {
                continue;
            }
            let envelope = run.input_for(&node);
            debug!(dag = %run.dag, task = %node, slices = envelope.len(), "dispatching task");

            let job = JobRecord::new(
                run.run_id,
                record.workflow.clone(),
                JobPayload::Task {
                    dag: spec.name.clone(),
                    task: node.clone(),
                    envelope,
                },
            );
            self.engine.queue.submit(job).await?;
            run.set_state(&node, NodeState::Running);
            self.record_state(run, &node, NodeState::Running).await;
        }
        Ok(())
    }

    async fn on_task_completed(
        &self,
        run: &mut DagRun,
        task: &str,
        output: &Envelope,
        routing: &Routing,
    ) -> Result<(), SchedulerError> {
        if run.state(task).is_terminal() {
            // At-least-once delivery: a redelivered job may complete twice
            debug!(dag = %run.dag, task, "duplicate completion ignored");
            return Ok(());
        }
        run.set_state(task, NodeState::Succeeded);
        self.record_state(run, task, NodeState::Succeeded).await;

        let mut skip_seeds = Vec::new();
        let edges: Vec<_> = run.topology.children(task).cloned().collect();
        for edge in edges {
            if routing.suppresses(&edge.child) {
                // A suppressed child is a skip decision, otherwise it would
                // wait on this parent forever
                skip_seeds.push(edge.child.clone());
                continue;
            }

            let delivered = match &edge.slot {
                Some(slot) => output.project(slot).unwrap_or_else(|| {
                    warn!(
                        dag = %run.dag,
                        task,
                        slot = %slot,
                        "labeled slot missing from output, delivering empty envelope"
                    );
                    Envelope::new()
                }),
                None => output.fork(),
            };

            run.accumulators
                .entry(edge.child.clone())
                .or_default()
                .push((task.to_string(), delivered));
            run.resolve_parent(&edge.child);
        }

        if !skip_seeds.is_empty() {
            self.apply_skips(run, skip_seeds).await?;
        }
        Ok(())
    }

    async fn on_task_failed(
        &self,
        run: &mut DagRun,
        task: &str,
        kind: &str,
    ) -> Result<(), SchedulerError> {
        if run.state(task).is_terminal() {
            return Ok(());
        }
        run.set_state(task, NodeState::Failed);
        self.record_state(run, task, NodeState::Failed).await;
        run.first_failure.get_or_insert_with(|| FailureSummary {
            dag: run.dag.clone(),
            task: task.to_string(),
            kind: kind.to_string(),
        });

        match self.policy {
            DagPolicy::Strict => {
                warn!(dag = %run.dag, task, "task failed, failing dag (strict policy)");
                run.draining = true;
                // Give in-flight tasks the co-operative stop signal
                self.engine
                    .bus
                    .publish(Signal::stop(
                        run.run_id,
                        crate::signal::SignalScope::Dag {
                            dag: run.dag.clone(),
                        },
                    ))
                    .await?;
            }
            DagPolicy::Lenient => {
                warn!(dag = %run.dag, task, "task failed, skipping dead descendants (lenient policy)");
                let non_live = run.non_live();
                let seeds: Vec<String> = run
                    .topology
                    .children(task)
                    .filter(|e| {
                        run.topology
                            .parents(&e.child)
                            .all(|p| non_live.contains(&p.parent))
                    })
                    .map(|e| e.child.clone())
                    .collect();

                // Children with another live parent still run
                let children: Vec<String> =
                    run.topology.children(task).map(|e| e.child.clone()).collect();
                self.apply_skips(run, seeds).await?;
                for child in children {
                    if !run.state(&child).is_terminal() {
                        run.resolve_parent(&child);
                    }
                }
            }
        }
        Ok(())
    }

    /// Mark seeds plus their dead descendants as skipped
    async fn apply_skips(
        &self,
        run: &mut DagRun,
        seeds: Vec<String>,
    ) -> Result<(), SchedulerError> {
        if seeds.is_empty() {
            return Ok(());
        }
        let already = run.non_live();
        let skipped = run.topology.propagate_skips(&seeds, &already);

        let mut newly_skipped = Vec::new();
        for node in &skipped {
            if !run.state(node).is_terminal() {
                run.set_state(node, NodeState::Skipped);
                newly_skipped.push(node.clone());
            }
        }

        for node in &newly_skipped {
            info!(dag = %run.dag, task = %node, "task skipped");
            self.record_state(run, node, NodeState::Skipped).await;
            self.engine
                .bus
                .publish(Signal::task_skipped(run.run_id, run.dag.clone(), node.clone()))
                .await?;

            // A skipped parent resolves its children without delivering data
            let children: Vec<String> =
                run.topology.children(node).map(|e| e.child.clone()).collect();
            for child in children {
                if !run.state(&child).is_terminal() {
                    run.resolve_parent(&child);
                }
            }
        }
        Ok(())
    }

    /// Emit the terminal signal and settle leftover nodes
    async fn finalize(&self, run: &mut DagRun, aborted: bool) -> Result<(), SchedulerError> {
        // Nodes that will never run count as skipped, so a terminal DAG has
        // only terminal nodes
        let leftovers: Vec<String> = run
            .states
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(n, _)| n.clone())
            .collect();
        for node in leftovers {
            run.set_state(&node, NodeState::Skipped);
            self.record_state(run, &node, NodeState::Skipped).await;
        }

        let failed = run.any_failed() || aborted;
        let signal = if failed {
            Signal::new(
                run.run_id,
                SignalKind::DagFailed {
                    dag: run.dag.clone(),
                    aborted,
                    first_failure: run.first_failure.clone(),
                },
            )
        } else {
            Signal::new(
                run.run_id,
                SignalKind::DagCompleted {
                    dag: run.dag.clone(),
                    stopped: run.stopped,
                },
            )
        };

        let outcome = if failed { "failed" } else { "completed" };
        info!(dag = %run.dag, outcome, aborted, stopped = run.stopped, "dag run finished");
        let section = Section::dag(&run.dag);
        let _ = self
            .engine
            .store
            .set(run.run_id, &section, "state", json!(outcome))
            .await;

        self.engine.bus.publish(signal).await?;
        Ok(())
    }

    /// Best-effort node state bookkeeping in the run document
    async fn record_state(&self, run: &DagRun, node: &str, state: NodeState) {
        let section = Section::dag(&run.dag);
        let key = format!("node/{node}");
        let _ = self
            .engine
            .store
            .set(run.run_id, &section, &key, json!(state.to_string()))
            .await;
    }
}
