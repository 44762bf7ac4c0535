//! Workflow definitions: DAG specs, task nodes, body kinds, YAML files

mod workflow;

pub use workflow::{BodyKind, DagSpec, SpecError, TaskNode, WorkflowDef, WorkflowLibrary};
