//! Document store trait and the run-scoped handle
//!
//! One document per workflow run, keyed by run id, laid out in sections:
//! `meta/*` (run metadata), `workflow/*` (workflow-scoped mutable state),
//! `dag/<name>/*` and `task/<dag>/<task>/*`. Writes are atomic per key and
//! last-writer-wins; there are no cross-key transactions and readers must
//! tolerate stale reads.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No live document for this run
    #[error("no document for run {0}")]
    DocNotFound(Uuid),

    /// push() on a key holding a non-list value
    #[error("key {0} does not hold a list")]
    NotAList(String),

    /// Store unreachable or failing
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Workflow run lifecycle state, persisted under `meta/state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    /// Stop requested, draining
    Stopping,
    Stopped,
    Succeeded,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Succeeded | Self::Failed | Self::Aborted
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Logical section of a run document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Section {
    Meta,
    Workflow,
    Dag(String),
    Task { dag: String, task: String },
}

impl Section {
    pub fn dag(name: impl Into<String>) -> Self {
        Self::Dag(name.into())
    }

    pub fn task(dag: impl Into<String>, task: impl Into<String>) -> Self {
        Self::Task {
            dag: dag.into(),
            task: task.into(),
        }
    }

    /// Key prefix used in the underlying document
    pub fn prefix(&self) -> String {
        match self {
            Self::Meta => "meta".to_string(),
            Self::Workflow => "workflow".to_string(),
            Self::Dag(name) => format!("dag/{name}"),
            Self::Task { dag, task } => format!("task/{dag}/{task}"),
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.prefix())
    }
}

/// Keyed document store, one document per workflow run
///
/// The concrete client is an external collaborator; implementations must
/// be thread-safe and provide per-key atomic writes.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Create the run document; idempotent for at-least-once job delivery
    async fn create_doc(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Read a key; consults the archive for finished runs
    async fn get(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    /// Write a key (last-writer-wins)
    async fn set(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Append to a list-valued key, creating it if absent
    async fn push(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Whether a key exists
    async fn exists(&self, run_id: Uuid, section: &Section, key: &str)
        -> Result<bool, StoreError>;

    /// Remove a key; returns whether it existed
    async fn delete(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Result<bool, StoreError>;

    /// Move the document to the archive keyspace at run finalization
    async fn archive_doc(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Whether a live (unarchived) document exists
    async fn doc_exists(&self, run_id: Uuid) -> Result<bool, StoreError>;
}

/// Run-scoped store handle passed to schedulers and task bodies
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn DocumentStore>,
    run_id: Uuid,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn DocumentStore>, run_id: Uuid) -> Self {
        Self { store, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn get(
        &self,
        section: &Section,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.store.get(self.run_id, section, key).await
    }

    pub async fn set(
        &self,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.set(self.run_id, section, key, value).await
    }

    pub async fn push(
        &self,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.push(self.run_id, section, key, value).await
    }

    pub async fn exists(&self, section: &Section, key: &str) -> Result<bool, StoreError> {
        self.store.exists(self.run_id, section, key).await
    }

    pub async fn delete(&self, section: &Section, key: &str) -> Result<bool, StoreError> {
        self.store.delete(self.run_id, section, key).await
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_prefixes() {
        assert_eq!(Section::Meta.prefix(), "meta");
        assert_eq!(Section::Workflow.prefix(), "workflow");
        assert_eq!(Section::dag("main").prefix(), "dag/main");
        assert_eq!(Section::task("main", "a").prefix(), "task/main/a");
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::Stopping.is_terminal());
    }

    #[test]
    fn test_run_state_display_matches_serde() {
        assert_eq!(RunState::Succeeded.to_string(), "succeeded");
        assert_eq!(RunState::Stopping.to_string(), "stopping");
    }
}
