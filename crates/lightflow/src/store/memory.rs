//! In-memory implementation of DocumentStore

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::doc::{DocumentStore, Section, StoreError};

type Doc = HashMap<String, HashMap<String, serde_json::Value>>;

/// In-memory document store
///
/// Reference implementation with the same semantics a remote document
/// store client must provide: per-key atomic writes, last-writer-wins,
/// archive keyspace for finished runs.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    live: RwLock<HashMap<Uuid, Doc>>,
    archived: RwLock<HashMap<Uuid, Doc>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live documents
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Whether the run has been archived
    pub fn is_archived(&self, run_id: Uuid) -> bool {
        self.archived.read().contains_key(&run_id)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create_doc(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.live.write().entry(run_id).or_default();
        Ok(())
    }

    async fn get(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let prefix = section.prefix();
        if let Some(doc) = self.live.read().get(&run_id) {
            return Ok(doc.get(&prefix).and_then(|s| s.get(key)).cloned());
        }
        if let Some(doc) = self.archived.read().get(&run_id) {
            return Ok(doc.get(&prefix).and_then(|s| s.get(key)).cloned());
        }
        Err(StoreError::DocNotFound(run_id))
    }

    async fn set(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut live = self.live.write();
        let doc = live
            .get_mut(&run_id)
            .ok_or(StoreError::DocNotFound(run_id))?;
        doc.entry(section.prefix())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn push(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut live = self.live.write();
        let doc = live
            .get_mut(&run_id)
            .ok_or(StoreError::DocNotFound(run_id))?;
        let entry = doc
            .entry(section.prefix())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));

        match entry {
            serde_json::Value::Array(items) => {
                items.push(value);
                Ok(())
            }
            _ => Err(StoreError::NotAList(key.to_string())),
        }
    }

    async fn exists(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.get(run_id, section, key).await?.is_some())
    }

    async fn delete(
        &self,
        run_id: Uuid,
        section: &Section,
        key: &str,
    ) -> Result<bool, StoreError> {
        let mut live = self.live.write();
        let doc = live
            .get_mut(&run_id)
            .ok_or(StoreError::DocNotFound(run_id))?;
        Ok(doc
            .get_mut(&section.prefix())
            .and_then(|s| s.remove(key))
            .is_some())
    }

    async fn archive_doc(&self, run_id: Uuid) -> Result<(), StoreError> {
        let doc = self
            .live
            .write()
            .remove(&run_id)
            .ok_or(StoreError::DocNotFound(run_id))?;
        self.archived.write().insert(run_id, doc);
        Ok(())
    }

    async fn doc_exists(&self, run_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.live.read().contains_key(&run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();

        let section = Section::task("main", "a");
        store.set(run_id, &section, "result", json!(42)).await.unwrap();

        assert_eq!(
            store.get(run_id, &section, "result").await.unwrap(),
            Some(json!(42))
        );
        assert_eq!(store.get(run_id, &section, "other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sections_are_isolated() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();

        store
            .set(run_id, &Section::Workflow, "k", json!("workflow"))
            .await
            .unwrap();
        store
            .set(run_id, &Section::dag("main"), "k", json!("dag"))
            .await
            .unwrap();

        assert_eq!(
            store.get(run_id, &Section::Workflow, "k").await.unwrap(),
            Some(json!("workflow"))
        );
        assert_eq!(
            store.get(run_id, &Section::dag("main"), "k").await.unwrap(),
            Some(json!("dag"))
        );
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();

        store
            .set(run_id, &Section::Workflow, "k", json!(1))
            .await
            .unwrap();
        store
            .set(run_id, &Section::Workflow, "k", json!(2))
            .await
            .unwrap();

        assert_eq!(
            store.get(run_id, &Section::Workflow, "k").await.unwrap(),
            Some(json!(2))
        );
    }

    #[tokio::test]
    async fn test_push_appends() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();

        let section = Section::Workflow;
        store.push(run_id, &section, "log", json!("a")).await.unwrap();
        store.push(run_id, &section, "log", json!("b")).await.unwrap();

        assert_eq!(
            store.get(run_id, &section, "log").await.unwrap(),
            Some(json!(["a", "b"]))
        );
    }

    #[tokio::test]
    async fn test_push_on_scalar_fails() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();

        store
            .set(run_id, &Section::Workflow, "k", json!(1))
            .await
            .unwrap();

        assert!(matches!(
            store.push(run_id, &Section::Workflow, "k", json!(2)).await,
            Err(StoreError::NotAList(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_doc_errors() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();

        assert!(matches!(
            store.get(run_id, &Section::Meta, "k").await,
            Err(StoreError::DocNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_keeps_reads_blocks_writes() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();
        store
            .set(run_id, &Section::Meta, "state", json!("succeeded"))
            .await
            .unwrap();

        store.archive_doc(run_id).await.unwrap();
        assert!(store.is_archived(run_id));
        assert!(!store.doc_exists(run_id).await.unwrap());

        // Terminal metadata stays readable
        assert_eq!(
            store.get(run_id, &Section::Meta, "state").await.unwrap(),
            Some(json!("succeeded"))
        );

        // Writes after archival are refused
        assert!(matches!(
            store.set(run_id, &Section::Meta, "state", json!("x")).await,
            Err(StoreError::DocNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_doc_idempotent() {
        let store = InMemoryDocumentStore::new();
        let run_id = Uuid::now_v7();
        store.create_doc(run_id).await.unwrap();
        store
            .set(run_id, &Section::Meta, "k", json!(1))
            .await
            .unwrap();

        // Re-delivered workflow job must not wipe the document
        store.create_doc(run_id).await.unwrap();
        assert_eq!(
            store.get(run_id, &Section::Meta, "k").await.unwrap(),
            Some(json!(1))
        );
    }
}
