//! Signal messages carried on the bus
//!
//! Signals carry coordination, never the authoritative work record — that
//! stays on the job queue. They are ephemeral: no at-rest persistence
//! beyond the bus substrate's pub/sub lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::{Envelope, Routing};
use crate::store::RunState;

/// Which part of a run a stop/abort addresses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum SignalScope {
    /// The whole run: the workflow scheduler and every DAG
    Workflow,
    /// One DAG and its in-flight tasks
    Dag { dag: String },
}

impl SignalScope {
    /// Whether the scope covers the named DAG
    pub fn covers_dag(&self, dag: &str) -> bool {
        match self {
            Self::Workflow => true,
            Self::Dag { dag: scoped } => scoped == dag,
        }
    }
}

/// What a query addresses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    /// The workflow scheduler of a run
    Run,
    /// Workers listening on the control channel
    Workers,
}

/// The first failing task of a failed DAG or run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureSummary {
    pub dag: String,
    pub task: String,
    pub kind: String,
}

/// Signal payload variants
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalKind {
    /// A task finished successfully
    TaskCompleted {
        dag: String,
        task: String,
        output: Envelope,
        #[serde(default)]
        routing: Routing,
        /// The body asked to stop this DAG after recording completion
        #[serde(default)]
        stop_dag: bool,
    },

    /// A task exhausted its retry budget
    TaskFailed {
        dag: String,
        task: String,
        kind: String,
        message: String,
    },

    /// A task was skipped without running
    TaskSkipped { dag: String, task: String },

    /// Co-operative stop: no new dispatch, in-flight work drains
    StopRequest { scope: SignalScope },

    /// Terminal abort: no new dispatch, no drain
    AbortRequest { scope: SignalScope },

    /// Launch a non-autostart DAG, optionally seeding its roots
    RunDag {
        dag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<Envelope>,
    },

    /// A DAG finished with no failures
    DagCompleted {
        dag: String,
        /// Finished via a stop request or a stop-dag task outcome
        #[serde(default)]
        stopped: bool,
    },

    /// A DAG finished with failures or was aborted
    DagFailed {
        dag: String,
        #[serde(default)]
        aborted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_failure: Option<FailureSummary>,
    },

    /// The run reached a terminal state
    WorkflowCompleted {
        state: RunState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_failure: Option<FailureSummary>,
    },

    /// Introspection request; answered with a QueryReply
    Query { target: QueryTarget },

    /// Introspection reply, correlated with its Query
    QueryReply { body: serde_json::Value },
}

/// A message on the run's signal channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    /// Run whose channel carries this signal
    pub run_id: Uuid,

    /// Set on queries and echoed on their replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,

    pub sent_at: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: SignalKind,
}

impl Signal {
    pub fn new(run_id: Uuid, kind: SignalKind) -> Self {
        Self {
            run_id,
            correlation_id: None,
            sent_at: Utc::now(),
            kind,
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn task_completed(
        run_id: Uuid,
        dag: impl Into<String>,
        task: impl Into<String>,
        output: Envelope,
        routing: Routing,
    ) -> Self {
        Self::new(
            run_id,
            SignalKind::TaskCompleted {
                dag: dag.into(),
                task: task.into(),
                output,
                routing,
                stop_dag: false,
            },
        )
    }

    pub fn task_failed(
        run_id: Uuid,
        dag: impl Into<String>,
        task: impl Into<String>,
        kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            SignalKind::TaskFailed {
                dag: dag.into(),
                task: task.into(),
                kind: kind.into(),
                message: message.into(),
            },
        )
    }

    pub fn task_skipped(run_id: Uuid, dag: impl Into<String>, task: impl Into<String>) -> Self {
        Self::new(
            run_id,
            SignalKind::TaskSkipped {
                dag: dag.into(),
                task: task.into(),
            },
        )
    }

    pub fn stop(run_id: Uuid, scope: SignalScope) -> Self {
        Self::new(run_id, SignalKind::StopRequest { scope })
    }

    pub fn abort(run_id: Uuid, scope: SignalScope) -> Self {
        Self::new(run_id, SignalKind::AbortRequest { scope })
    }

    pub fn run_dag(run_id: Uuid, dag: impl Into<String>, seed: Option<Envelope>) -> Self {
        Self::new(
            run_id,
            SignalKind::RunDag {
                dag: dag.into(),
                seed,
            },
        )
    }

    pub fn query(run_id: Uuid, target: QueryTarget) -> Self {
        Self::new(run_id, SignalKind::Query { target })
    }

    pub fn query_reply(run_id: Uuid, correlation_id: Uuid, body: serde_json::Value) -> Self {
        Self::new(run_id, SignalKind::QueryReply { body }).with_correlation(correlation_id)
    }

    /// Whether this is a stop or abort covering the named DAG
    pub fn interrupts_dag(&self, dag: &str) -> bool {
        match &self.kind {
            SignalKind::StopRequest { scope } | SignalKind::AbortRequest { scope } => {
                scope.covers_dag(dag)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_coverage() {
        assert!(SignalScope::Workflow.covers_dag("main"));
        assert!(SignalScope::Dag {
            dag: "main".to_string()
        }
        .covers_dag("main"));
        assert!(!SignalScope::Dag {
            dag: "other".to_string()
        }
        .covers_dag("main"));
    }

    #[test]
    fn test_interrupts_dag() {
        let run_id = Uuid::now_v7();
        let stop = Signal::stop(
            run_id,
            SignalScope::Dag {
                dag: "main".to_string(),
            },
        );
        assert!(stop.interrupts_dag("main"));
        assert!(!stop.interrupts_dag("other"));

        let completed =
            Signal::task_completed(run_id, "main", "a", Envelope::new(), Routing::all());
        assert!(!completed.interrupts_dag("main"));
    }

    #[test]
    fn test_signal_serialization() {
        let run_id = Uuid::now_v7();
        let signal = Signal::task_failed(run_id, "main", "b", "task_body", "boom");

        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"type\":\"task_failed\""));

        let parsed: Signal = serde_json::from_str(&json).unwrap();
        assert_eq!(signal, parsed);
    }

    #[test]
    fn test_query_reply_correlation() {
        let run_id = Uuid::now_v7();
        let correlation = Uuid::now_v7();
        let reply = Signal::query_reply(run_id, correlation, serde_json::json!({"ok": true}));
        assert_eq!(reply.correlation_id, Some(correlation));
    }
}
