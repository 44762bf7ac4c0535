//! Per-run keyed document store with scoped sections

mod doc;
mod memory;

pub use doc::{DocumentStore, RunState, Section, StoreError, StoreHandle};
pub use memory::InMemoryDocumentStore;
