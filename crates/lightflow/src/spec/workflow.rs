//! Workflow definition files
//!
//! A workflow is a YAML document declaring one or more DAGs of task nodes.
//! Definitions are validated eagerly — cycle or wiring mistakes surface at
//! load or submission time, before any job is enqueued.
//!
//! ```yaml
//! name: etl
//! description: Ingest, clean and publish the nightly batch
//! dags:
//!   - name: main
//!     tasks:
//!       - name: ingest
//!         body: { kind: script, handler: ingest }
//!         outputs: [rows]
//!       - name: publish
//!         body: { kind: command, program: publish.sh }
//!     edges:
//!       - { parent: ingest, child: publish, slot: rows }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::{DagError, DagTopology, Edge};
use crate::reliability::RetryPolicy;

/// Error type for definition loading and validation
#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    /// Filesystem error while reading workflow files
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed YAML in a workflow file
    #[error("yaml error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// Two workflows with the same name in the search paths
    #[error("duplicate workflow name: {0}")]
    DuplicateWorkflow(String),

    /// Two DAGs with the same name in one workflow
    #[error("duplicate dag name in workflow {workflow}: {dag}")]
    DuplicateDag { workflow: String, dag: String },

    /// Graph validation failed for a DAG
    #[error("invalid dag {dag}: {source}")]
    Dag { dag: String, source: DagError },

    /// An edge slot label is not among the parent's declared outputs
    #[error("dag {dag}: edge {parent} -> {child} carries undeclared slot {slot}")]
    UnknownSlot {
        dag: String,
        parent: String,
        child: String,
        slot: String,
    },

    /// Multiple outgoing edges on one (parent, slot) without fan-out
    #[error("dag {dag}: task {parent} fans out slot {slot:?} without declaring fan_out")]
    FanOutUndeclared {
        dag: String,
        parent: String,
        slot: Option<String>,
    },

    /// Lookup of an unknown workflow name
    #[error("unknown workflow: {0}")]
    WorkflowNotFound(String),

    /// Lookup of an unknown DAG name within a workflow
    #[error("workflow {workflow} has no dag named {dag}")]
    DagNotFound { workflow: String, dag: String },

    /// Lookup of an unknown task name within a DAG
    #[error("dag {dag} has no task named {task}")]
    TaskNotFound { dag: String, task: String },
}

/// How a task body executes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyKind {
    /// In-process handler resolved by name from the worker's body registry
    Script { handler: String },

    /// External process; stdout feeds the first declared output slot
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
}

/// One task node in a DAG
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNode {
    /// Name, unique within the DAG
    pub name: String,

    /// Body to execute
    pub body: BodyKind,

    /// Declared input slot names; `None` means "all delivered slices"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,

    /// Declared output slot names
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Input alias map: body-facing name -> slot
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub aliases: HashMap<String, String>,

    /// Retry policy for body failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Optional wall-clock deadline for one body invocation
    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,

    /// Permit multiple outgoing edges on the same (parent, slot) pair
    #[serde(default)]
    pub fan_out: bool,
}

impl TaskNode {
    /// Create a node with defaults for everything but name and body
    pub fn new(name: impl Into<String>, body: BodyKind) -> Self {
        Self {
            name: name.into(),
            body,
            inputs: None,
            outputs: Vec::new(),
            aliases: HashMap::new(),
            retry: RetryPolicy::default(),
            deadline: None,
            fan_out: false,
        }
    }

    /// Shorthand for a script-body node
    pub fn script(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            name,
            BodyKind::Script {
                handler: handler.into(),
            },
        )
    }

    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = Some(inputs.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_alias(mut self, name: impl Into<String>, slot: impl Into<String>) -> Self {
        self.aliases.insert(name.into(), slot.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }
}

/// One DAG within a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagSpec {
    /// Name, unique within the workflow
    pub name: String,

    /// Enqueued automatically at workflow start; `false` means the DAG only
    /// runs on an explicit run-dag signal
    #[serde(default = "default_true")]
    pub autostart: bool,

    pub tasks: Vec<TaskNode>,

    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_true() -> bool {
    true
}

impl DagSpec {
    /// Create an empty autostart DAG
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            autostart: true,
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn manual_start(mut self) -> Self {
        self.autostart = false;
        self
    }

    pub fn with_task(mut self, task: TaskNode) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Look up a task node by name
    pub fn task(&self, name: &str) -> Result<&TaskNode, SpecError> {
        self.tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SpecError::TaskNotFound {
                dag: self.name.clone(),
                task: name.to_string(),
            })
    }

    /// Build the validated graph for this DAG
    pub fn topology(&self) -> Result<DagTopology, SpecError> {
        let nodes = self.tasks.iter().map(|t| t.name.clone()).collect();
        DagTopology::build(nodes, self.edges.clone()).map_err(|source| SpecError::Dag {
            dag: self.name.clone(),
            source,
        })
    }

    /// Validate the graph plus slot/fan-out wiring
    pub fn validate(&self) -> Result<(), SpecError> {
        let topology = self.topology()?;

        for edge in topology.edges() {
            let parent = self.task(&edge.parent)?;
            if let Some(slot) = &edge.slot {
                if !parent.outputs.is_empty() && !parent.outputs.contains(slot) {
                    return Err(SpecError::UnknownSlot {
                        dag: self.name.clone(),
                        parent: edge.parent.clone(),
                        child: edge.child.clone(),
                        slot: slot.clone(),
                    });
                }
            }
        }

        // At most one outgoing edge per (parent, slot) unless fan-out is declared
        let mut seen: HashSet<(&str, Option<&str>)> = HashSet::new();
        for edge in topology.edges() {
            let key = (edge.parent.as_str(), edge.slot.as_deref());
            if !seen.insert(key) && !self.task(&edge.parent)?.fan_out {
                return Err(SpecError::FanOutUndeclared {
                    dag: self.name.clone(),
                    parent: edge.parent.clone(),
                    slot: edge.slot.clone(),
                });
            }
        }

        Ok(())
    }
}

/// A user-authored workflow: one or more DAGs plus metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDef {
    pub name: String,

    /// First line is shown by `workflow list`
    #[serde(default)]
    pub description: String,

    pub dags: Vec<DagSpec>,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            dags: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dag(mut self, dag: DagSpec) -> Self {
        self.dags.push(dag);
        self
    }

    /// Look up a DAG spec by name
    pub fn dag(&self, name: &str) -> Result<&DagSpec, SpecError> {
        self.dags
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| SpecError::DagNotFound {
                workflow: self.name.clone(),
                dag: name.to_string(),
            })
    }

    /// DAGs enqueued automatically at workflow start
    pub fn autostart_dags(&self) -> impl Iterator<Item = &DagSpec> {
        self.dags.iter().filter(|d| d.autostart)
    }

    /// Validate every DAG and the workflow-level invariants
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut names = HashSet::new();
        for dag in &self.dags {
            if !names.insert(dag.name.as_str()) {
                return Err(SpecError::DuplicateDag {
                    workflow: self.name.clone(),
                    dag: dag.name.clone(),
                });
            }
            dag.validate()?;
        }
        Ok(())
    }

    /// Parse and validate a single workflow file
    pub fn from_file(path: &Path) -> Result<Self, SpecError> {
        let text = std::fs::read_to_string(path)?;
        let def: Self = serde_yaml::from_str(&text).map_err(|source| SpecError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        def.validate()?;
        Ok(def)
    }
}

/// The set of workflow definitions known to a process
///
/// Populated from the configured search paths at startup, or directly via
/// [`WorkflowLibrary::insert`] for embedded deployments and tests.
#[derive(Debug, Default)]
pub struct WorkflowLibrary {
    workflows: HashMap<String, WorkflowDef>,
}

impl WorkflowLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.yaml`/`.yml` file in the given search paths
    ///
    /// Missing directories are skipped; malformed or invalid files fail the
    /// whole discovery (fail fast, before any job runs).
    pub fn discover(paths: &[PathBuf]) -> Result<Self, SpecError> {
        let mut library = Self::new();
        for dir in paths {
            if !dir.is_dir() {
                debug!(path = %dir.display(), "workflow search path missing, skipping");
                continue;
            }
            let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e == "yaml" || e == "yml")
                })
                .collect();
            entries.sort();
            for path in entries {
                let def = WorkflowDef::from_file(&path)?;
                debug!(workflow = %def.name, path = %path.display(), "loaded workflow");
                library.insert(def)?;
            }
        }
        Ok(library)
    }

    /// Add a validated definition
    pub fn insert(&mut self, def: WorkflowDef) -> Result<(), SpecError> {
        def.validate()?;
        if self.workflows.contains_key(&def.name) {
            return Err(SpecError::DuplicateWorkflow(def.name));
        }
        self.workflows.insert(def.name.clone(), def);
        Ok(())
    }

    /// Look up a workflow by name
    pub fn get(&self, name: &str) -> Result<&WorkflowDef, SpecError> {
        self.workflows
            .get(name)
            .ok_or_else(|| SpecError::WorkflowNotFound(name.to_string()))
    }

    /// All definitions, sorted by name
    pub fn list(&self) -> Vec<&WorkflowDef> {
        let mut defs: Vec<_> = self.workflows.values().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
