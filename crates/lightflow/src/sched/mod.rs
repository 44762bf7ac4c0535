//! The two-tier scheduler: workflow-of-DAGs over DAG-of-tasks

mod dag;
mod workflow;

pub use dag::{DagPolicy, DagScheduler};
pub use workflow::{
    abort_run, run_status, stop_run, submit_workflow, RunStatus, SchedulerError, WorkflowScheduler,
};
