//! # Lightflow Engine
//!
//! A distributed workflow engine executing DAGs of tasks with no central
//! daemon: every unit of orchestration — a workflow, a DAG, a task — is a
//! job on a broker queue, consumed by interchangeable workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkflowScheduler                         │
//! │  (run lifecycle, one dag job per autostart DAG, run-dag)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ dag jobs
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DagScheduler                            │
//! │  (ready-set dispatch, data routing, skips, stop/abort)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ task jobs        ▲ signals
//!                              ▼                  │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskRunner                             │
//! │  (marshal inputs, invoke body, classify, emit signal)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Completion and data propagation flow back to the DAG scheduler through
//! the signal bus, never through the job queue. Cross-task state lives in
//! a per-run document store. All three collaborators (broker, bus, store)
//! sit behind traits with in-process reference implementations.
//!
//! ## Example
//!
//! ```ignore
//! use lightflow::prelude::*;
//!
//! let bodies = BodyRegistry::new();
//! bodies.register("hello", |_ctx| async {
//!     Ok(TaskOutcome::empty())
//! });
//!
//! let mut library = WorkflowLibrary::new();
//! library.insert(
//!     WorkflowDef::new("demo")
//!         .with_dag(DagSpec::new("main").with_task(TaskNode::script("a", "hello"))),
//! )?;
//!
//! let engine = Engine::in_memory(library, bodies);
//! let worker = Worker::new(engine.clone(), WorkerConfig::default());
//! worker.start().await?;
//!
//! let run_id = submit_workflow(&engine, "demo", serde_json::json!({})).await?;
//! ```

pub mod config;
pub mod dag;
pub mod data;
pub mod engine;
pub mod queue;
pub mod reliability;
pub mod sched;
pub mod signal;
pub mod spec;
pub mod store;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{Config, ConfigError};
    pub use crate::dag::{DagError, DagTopology, Edge, NodeState};
    pub use crate::data::{DataError, DataView, Envelope, Routing, Slice};
    pub use crate::engine::Engine;
    pub use crate::queue::{InMemoryBroker, JobPayload, JobQueue, JobRecord, QueueName};
    pub use crate::reliability::{RetryDecision, RetryPolicy};
    pub use crate::sched::{
        abort_run, run_status, stop_run, submit_workflow, DagPolicy, DagScheduler,
        SchedulerError, WorkflowScheduler,
    };
    pub use crate::signal::{
        InMemorySignalBus, QueryTarget, Signal, SignalBus, SignalKind, SignalScope,
    };
    pub use crate::spec::{BodyKind, DagSpec, SpecError, TaskNode, WorkflowDef, WorkflowLibrary};
    pub use crate::store::{DocumentStore, InMemoryDocumentStore, RunState, Section, StoreHandle};
    pub use crate::task::{BodyRegistry, BodyResult, TaskContext, TaskError, TaskOutcome};
    pub use crate::worker::{Worker, WorkerConfig};
}

// Re-export key types at crate root
pub use config::Config;
pub use engine::Engine;
pub use sched::{submit_workflow, DagScheduler, SchedulerError, WorkflowScheduler};
pub use spec::{WorkflowDef, WorkflowLibrary};
pub use task::{BodyRegistry, TaskContext, TaskOutcome};
pub use worker::{Worker, WorkerConfig};
