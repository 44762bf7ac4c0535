//! Job records: the authoritative unit of work on the broker

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::Envelope;

/// The three logical queues multiplexed over the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Workflow,
    Dag,
    Task,
}

impl QueueName {
    /// All queues, in dispatch-priority order
    pub const ALL: [QueueName; 3] = [Self::Workflow, Self::Dag, Self::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Dag => "dag",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "workflow" => Ok(Self::Workflow),
            "dag" => Ok(Self::Dag),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

/// Kind-specific job payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Start a workflow run with user launch parameters
    Workflow { params: serde_json::Value },

    /// Run one DAG of the workflow; `seed` carries the envelope of an
    /// explicit run-dag request
    Dag {
        dag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<Envelope>,
    },

    /// Run one task with its merged input envelope
    Task {
        dag: String,
        task: String,
        envelope: Envelope,
    },
}

impl JobPayload {
    /// The queue this payload belongs on
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Workflow { .. } => QueueName::Workflow,
            Self::Dag { .. } => QueueName::Dag,
            Self::Task { .. } => QueueName::Task,
        }
    }
}

/// A job on the broker; owned by the broker until acknowledged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    /// Broker job id
    pub id: Uuid,

    /// Workflow run this job belongs to
    pub run_id: Uuid,

    /// Workflow definition name, for resolution from the worker's library
    pub workflow: String,

    pub payload: JobPayload,

    /// Delivery attempt counter (1-based on first delivery)
    pub attempt: u32,
}

impl JobRecord {
    pub fn new(run_id: Uuid, workflow: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            workflow: workflow.into(),
            payload,
            attempt: 0,
        }
    }

    /// The queue this job belongs on
    pub fn queue(&self) -> QueueName {
        self.payload.queue()
    }

    /// Short human label for logs
    pub fn label(&self) -> String {
        match &self.payload {
            JobPayload::Workflow { .. } => format!("workflow:{}", self.workflow),
            JobPayload::Dag { dag, .. } => format!("dag:{}/{}", self.workflow, dag),
            JobPayload::Task { dag, task, .. } => {
                format!("task:{}/{}/{}", self.workflow, dag, task)
            }
        }
    }
}
