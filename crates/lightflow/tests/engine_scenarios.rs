//! End-to-end scenarios over the in-process substrates
//!
//! One worker services all three queues, so workflow jobs, dag jobs and
//! task jobs interleave in one process the way they would across hosts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use lightflow::dag::Edge;
use lightflow::prelude::*;
use lightflow::signal::{FailureSummary, SignalKind};

/// Signals observed on a run channel, in publish order
type SignalLog = Vec<SignalKind>;

struct Harness {
    engine: Arc<Engine>,
    worker: Worker,
}

impl Harness {
    /// Build the engine and a worker; the worker starts lazily so tests
    /// can subscribe to a run channel before any job is consumed
    async fn start(def: WorkflowDef, bodies: BodyRegistry) -> Self {
        let mut library = WorkflowLibrary::new();
        library.insert(def).unwrap();
        let engine = Engine::in_memory(library, bodies);

        let worker = Worker::new(
            Arc::clone(&engine),
            WorkerConfig::default()
                .with_concurrency(8)
                .with_poll_interval(Duration::from_millis(20)),
        );
        Self { engine, worker }
    }

    async fn ensure_worker(&self) {
        match self.worker.start().await {
            Ok(()) => {}
            Err(lightflow::worker::WorkerError::AlreadyRunning) => {}
            Err(err) => panic!("worker start failed: {err}"),
        }
    }

    /// Submit a workflow and follow its channel to the terminal signal
    async fn run_workflow(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> (Uuid, RunState, Option<FailureSummary>, SignalLog) {
        let run_id = submit_workflow(&self.engine, name, params).await.unwrap();
        // Subscribe while the job still sits on the queue: the worker only
        // starts afterwards, so no signal can be missed
        let stream = self.engine.bus.subscribe(run_id).await;
        self.ensure_worker().await;
        self.follow_stream(run_id, stream).await
    }

    /// Follow a channel subscribed earlier (before racing signals)
    async fn follow_stream(
        &self,
        run_id: Uuid,
        mut stream: lightflow::signal::SignalStream,
    ) -> (Uuid, RunState, Option<FailureSummary>, SignalLog) {
        let mut log = SignalLog::new();

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(signal) = stream.recv().await {
                let kind = signal.kind.clone();
                log.push(kind.clone());
                if let SignalKind::WorkflowCompleted {
                    state,
                    first_failure,
                } = kind
                {
                    return (state, first_failure);
                }
            }
            // Channel already closed: the run finalized before this
            // subscription; the archived document holds the terminal state
            let state = self
                .engine
                .store
                .get(run_id, &Section::Meta, "state")
                .await
                .unwrap()
                .and_then(|v| serde_json::from_value(v).ok())
                .expect("terminal state in archive");
            (state, None)
        })
        .await
        .expect("workflow terminates");

        (run_id, outcome.0, outcome.1, log)
    }

    async fn stop(self) {
        self.worker.shutdown().await.unwrap();
    }

    async fn store_key(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Option<serde_json::Value> {
        self.engine.store.get(run_id, section, key).await.unwrap()
    }
}

fn completed_task(kind: &SignalKind) -> Option<&str> {
    match kind {
        SignalKind::TaskCompleted { task, .. } => Some(task),
        _ => None,
    }
}

// Scenario 1: linear two-task DAG; completion order drives store writes
#[tokio::test]
async fn linear_two_task_dag() {
    let bodies = BodyRegistry::new();
    bodies.register("print_a", |_ctx| async {
        println!("task a");
        Ok(TaskOutcome::success(Envelope::from_slots([(
            "msg".to_string(),
            json!("from a"),
        )])?))
    });
    bodies.register("print_b", |ctx: TaskContext| async move {
        println!("task b, input: {:?}", ctx.data.get("msg"));
        Ok(TaskOutcome::empty())
    });

    let def = WorkflowDef::new("linear").with_dag(
        DagSpec::new("main")
            .with_task(TaskNode::script("a", "print_a").with_outputs(["msg"]))
            .with_task(TaskNode::script("b", "print_b"))
            .with_edge(Edge::new("a", "b")),
    );

    let harness = Harness::start(def, bodies).await;
    let (run_id, state, failure, log) = harness.run_workflow("linear", json!({})).await;

    assert_eq!(state, RunState::Succeeded);
    assert!(failure.is_none());

    // a completes strictly before b
    let completions: Vec<&str> = log.iter().filter_map(completed_task).collect();
    assert_eq!(completions, vec!["a", "b"]);

    // both task sections were written
    for task in ["a", "b"] {
        assert_eq!(
            harness
                .store_key(run_id, &Section::task("main", task), "state")
                .await,
            Some(json!("succeeded"))
        );
    }
    harness.stop().await;
}

// Scenario 2: fan-out via labeled slots, fan-in merge with history
#[tokio::test]
async fn fan_out_fan_in_data_routing() {
    let bodies = BodyRegistry::new();
    bodies.register("emit_xy", |_ctx| async {
        Ok(TaskOutcome::success(Envelope::from_slots([
            ("x".to_string(), json!(1)),
            ("y".to_string(), json!(2)),
        ])?))
    });
    // Forward the raw input so slice histories keep accumulating
    bodies.register("forward", |ctx: TaskContext| async move {
        Ok(TaskOutcome::success(ctx.input.clone()))
    });
    bodies.register("check_join", |ctx: TaskContext| async move {
        let input = ctx.input.clone();
        if input.len() != 2 {
            return Err(TaskError::fatal(
                "assertion",
                format!("expected 2 slices, got {}", input.len()),
            ));
        }
        let x = input
            .slice("x")
            .ok_or_else(|| TaskError::fatal("assertion", "missing x"))?;
        let y = input
            .slice("y")
            .ok_or_else(|| TaskError::fatal("assertion", "missing y"))?;
        if x.history != vec!["a".to_string(), "b".to_string()]
            || y.history != vec!["a".to_string(), "c".to_string()]
        {
            return Err(TaskError::fatal(
                "assertion",
                format!("unexpected histories: {:?} / {:?}", x.history, y.history),
            ));
        }
        if x.payload != json!(1) || y.payload != json!(2) {
            return Err(TaskError::fatal("assertion", "payloads corrupted"));
        }
        Ok(TaskOutcome::empty())
    });

    let def = WorkflowDef::new("diamond").with_dag(
        DagSpec::new("main")
            .with_task(TaskNode::script("a", "emit_xy").with_outputs(["x", "y"]))
            .with_task(TaskNode::script("b", "forward"))
            .with_task(TaskNode::script("c", "forward"))
            .with_task(TaskNode::script("d", "check_join"))
            .with_edge(Edge::new("a", "b").with_slot("x"))
            .with_edge(Edge::new("a", "c").with_slot("y"))
            .with_edge(Edge::new("b", "d"))
            .with_edge(Edge::new("c", "d")),
    );

    let harness = Harness::start(def, bodies).await;
    let (_run_id, state, failure, _log) = harness.run_workflow("diamond", json!({})).await;

    // check_join fails the run if routing or history is wrong
    assert_eq!(state, RunState::Succeeded, "failure: {failure:?}");
    harness.stop().await;
}

// Scenario 3: routing skip takes the branch, the sibling still runs
#[tokio::test]
async fn skip_branch_propagates() {
    let bodies = BodyRegistry::new();
    bodies.register("skip_b", |_ctx| async {
        Ok(TaskOutcome::routed(
            Envelope::new(),
            Routing::all().skipping(["b"]),
        ))
    });
    bodies.register("noop", |_ctx| async { Ok(TaskOutcome::empty()) });

    let def = WorkflowDef::new("skippy").with_dag(
        DagSpec::new("main")
            .with_task(TaskNode::script("a", "skip_b"))
            .with_task(TaskNode::script("b", "noop"))
            .with_task(TaskNode::script("c", "noop"))
            .with_task(TaskNode::script("d", "noop"))
            .with_edge(Edge::new("a", "b"))
            .with_edge(Edge::new("b", "c"))
            .with_edge(Edge::new("a", "d")),
    );

    let harness = Harness::start(def, bodies).await;
    let (run_id, state, _failure, log) = harness.run_workflow("skippy", json!({})).await;

    assert_eq!(state, RunState::Succeeded);

    let skipped: Vec<&str> = log
        .iter()
        .filter_map(|kind| match kind {
            SignalKind::TaskSkipped { task, .. } => Some(task.as_str()),
            _ => None,
        })
        .collect();
    assert!(skipped.contains(&"b"));
    assert!(skipped.contains(&"c"));
    assert!(!skipped.contains(&"d"));

    let completions: Vec<&str> = log.iter().filter_map(completed_task).collect();
    assert!(completions.contains(&"d"));

    assert_eq!(
        harness
            .store_key(run_id, &Section::dag("main"), "node/c")
            .await,
        Some(json!("skipped"))
    );
    harness.stop().await;
}

// Scenario 4: strict policy, a failing task fails dag and workflow
#[tokio::test]
async fn task_failure_fails_workflow() {
    let bodies = BodyRegistry::new();
    bodies.register("noop", |_ctx| async { Ok(TaskOutcome::empty()) });
    bodies.register("throw", |_ctx| async {
        Err::<TaskOutcome, _>(TaskError::fatal("task_body", "user exception"))
    });

    let def = WorkflowDef::new("doomed").with_dag(
        DagSpec::new("main")
            .with_task(TaskNode::script("a", "noop"))
            .with_task(
                TaskNode::script("b", "throw").with_retry(RetryPolicy::none()),
            )
            .with_edge(Edge::new("a", "b")),
    );

    let harness = Harness::start(def, bodies).await;
    let (_run_id, state, failure, log) = harness.run_workflow("doomed", json!({})).await;

    assert_eq!(state, RunState::Failed);
    let failure = failure.expect("first failure summary");
    assert_eq!((failure.dag.as_str(), failure.task.as_str()), ("main", "b"));
    assert_eq!(failure.kind, "task_body");

    assert!(log
        .iter()
        .any(|kind| matches!(kind, SignalKind::TaskFailed { task, .. } if task == "b")));
    assert!(log
        .iter()
        .any(|kind| matches!(kind, SignalKind::DagFailed { aborted: false, .. })));
    harness.stop().await;
}

// Scenario 5: stop mid-flight; the running task drains, nothing new runs
#[tokio::test]
async fn stop_mid_flight_drains() {
    let bodies = BodyRegistry::new();
    bodies.register("slow", |_ctx| async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        Ok(TaskOutcome::empty())
    });
    bodies.register("noop", |_ctx| async { Ok(TaskOutcome::empty()) });

    let def = WorkflowDef::new("longrun").with_dag(
        DagSpec::new("main")
            .with_task(TaskNode::script("a", "slow"))
            .with_task(TaskNode::script("b", "noop"))
            .with_edge(Edge::new("a", "b")),
    );

    let harness = Harness::start(def, bodies).await;
    let run_id = submit_workflow(&harness.engine, "longrun", json!({}))
        .await
        .unwrap();
    let stream = harness.engine.bus.subscribe(run_id).await;
    harness.ensure_worker().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    stop_run(&harness.engine, run_id).await.unwrap();

    let (_run_id, state, _failure, log) = harness.follow_stream(run_id, stream).await;

    assert_eq!(state, RunState::Stopped);

    // a ran to completion co-operatively; b was never dispatched
    let completions: Vec<&str> = log.iter().filter_map(completed_task).collect();
    assert_eq!(completions, vec!["a"]);
    assert!(log
        .iter()
        .any(|kind| matches!(kind, SignalKind::DagCompleted { stopped: true, .. })));
    harness.stop().await;
}

// Scenario 6: a task launches a non-autostart DAG; the run waits for both
#[tokio::test]
async fn dynamic_sub_dag() {
    let bodies = BodyRegistry::new();
    bodies.register("kickoff", |ctx: TaskContext| async move {
        let seed = Envelope::from_slots([("note".to_string(), json!("from main"))])?;
        ctx.signals.run_dag("sub", Some(seed)).await?;
        Ok(TaskOutcome::empty())
    });
    bodies.register("check_seed", |ctx: TaskContext| async move {
        if ctx.input.slice("note").is_none() {
            return Err(TaskError::fatal("assertion", "seed envelope missing"));
        }
        Ok(TaskOutcome::empty())
    });

    let def = WorkflowDef::new("dynamic")
        .with_dag(DagSpec::new("main").with_task(TaskNode::script("a", "kickoff")))
        .with_dag(
            DagSpec::new("sub")
                .manual_start()
                .with_task(TaskNode::script("s", "check_seed")),
        );

    let harness = Harness::start(def, bodies).await;
    let (_run_id, state, failure, log) = harness.run_workflow("dynamic", json!({})).await;

    assert_eq!(state, RunState::Succeeded, "failure: {failure:?}");

    // both dags reached dag-completed, and the workflow terminal signal
    // came after both
    let completed_dags: Vec<&str> = log
        .iter()
        .filter_map(|kind| match kind {
            SignalKind::DagCompleted { dag, .. } => Some(dag.as_str()),
            _ => None,
        })
        .collect();
    assert!(completed_dags.contains(&"main"));
    assert!(completed_dags.contains(&"sub"));
    harness.stop().await;
}

// Submitting twice yields independent runs and store documents
#[tokio::test]
async fn repeated_submission_is_independent() {
    let bodies = BodyRegistry::new();
    bodies.register("noop", |_ctx| async { Ok(TaskOutcome::empty()) });

    let def = WorkflowDef::new("twice")
        .with_dag(DagSpec::new("main").with_task(TaskNode::script("a", "noop")));

    let harness = Harness::start(def, bodies).await;
    let (run_a, state_a, _, _) = harness.run_workflow("twice", json!({"n": 1})).await;
    let (run_b, state_b, _, _) = harness.run_workflow("twice", json!({"n": 2})).await;

    assert_ne!(run_a, run_b);
    assert_eq!(state_a, RunState::Succeeded);
    assert_eq!(state_b, RunState::Succeeded);

    assert_eq!(
        harness.store_key(run_a, &Section::Meta, "params").await,
        Some(json!({"n": 1}))
    );
    assert_eq!(
        harness.store_key(run_b, &Section::Meta, "params").await,
        Some(json!({"n": 2}))
    );
    harness.stop().await;
}

// Abort terminates immediately without draining the slow task
#[tokio::test]
async fn abort_is_terminal_without_drain() {
    let bodies = BodyRegistry::new();
    bodies.register("glacial", |_ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(TaskOutcome::empty())
    });

    let def = WorkflowDef::new("aborted")
        .with_dag(DagSpec::new("main").with_task(TaskNode::script("a", "glacial")));

    let harness = Harness::start(def, bodies).await;
    let run_id = submit_workflow(&harness.engine, "aborted", json!({}))
        .await
        .unwrap();
    let stream = harness.engine.bus.subscribe(run_id).await;
    harness.ensure_worker().await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    abort_run(&harness.engine, run_id).await.unwrap();

    let started = std::time::Instant::now();
    let (_run_id, state, _failure, log) = harness.follow_stream(run_id, stream).await;

    assert_eq!(state, RunState::Aborted);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "abort must not wait for the 30s task"
    );
    assert!(log
        .iter()
        .any(|kind| matches!(kind, SignalKind::DagFailed { aborted: true, .. })));

    // The worker still holds the orphaned glacial task; don't drain it
    let status = run_status(&harness.engine, run_id, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(status.state, Some(RunState::Aborted));
}
