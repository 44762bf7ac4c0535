//! DAG topology: construction, validation, derived views, skip propagation

mod topology;

pub use topology::{DagError, DagTopology, Edge, NodeState};
