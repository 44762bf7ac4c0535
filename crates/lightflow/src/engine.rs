//! Shared handle bundle wired into schedulers, task runners and workers
//!
//! There is no ambient global state: every component receives an
//! [`Engine`] explicitly. The bundle is cheap to clone behind an `Arc`.

use std::sync::Arc;

use crate::queue::{InMemoryBroker, JobQueue};
use crate::signal::{InMemorySignalBus, SignalBus};
use crate::spec::WorkflowLibrary;
use crate::store::{DocumentStore, InMemoryDocumentStore};
use crate::task::BodyRegistry;

/// The collaborator handles one process shares across its components
pub struct Engine {
    pub queue: Arc<dyn JobQueue>,
    pub bus: Arc<dyn SignalBus>,
    pub store: Arc<dyn DocumentStore>,
    pub library: Arc<WorkflowLibrary>,
    pub bodies: Arc<BodyRegistry>,
}

impl Engine {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        bus: Arc<dyn SignalBus>,
        store: Arc<dyn DocumentStore>,
        library: Arc<WorkflowLibrary>,
        bodies: Arc<BodyRegistry>,
    ) -> Self {
        Self {
            queue,
            bus,
            store,
            library,
            bodies,
        }
    }

    /// Engine over the in-process substrates, for embedded deployments and
    /// tests
    pub fn in_memory(library: WorkflowLibrary, bodies: BodyRegistry) -> Arc<Self> {
        Arc::new(Self::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemorySignalBus::new()),
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(library),
            Arc::new(bodies),
        ))
    }
}
