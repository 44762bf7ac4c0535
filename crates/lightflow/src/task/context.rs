//! Execution context handed to task bodies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::data::{DataView, Envelope};
use crate::signal::{Signal, SignalBus, SignalError};
use crate::store::StoreHandle;

/// Run-scoped signal handle for task bodies
///
/// Lets a body consult the co-operative stop flag and launch
/// non-autostart DAGs. The stop flag is maintained by a background
/// watcher the task runner owns; bodies only read it.
///
/// # Example
///
/// ```ignore
/// async fn body(ctx: TaskContext) -> BodyResult {
///     for chunk in chunks {
///         if ctx.signals.is_stop_requested() {
///             break; // exit early, co-operatively
///         }
///         process(chunk).await?;
///     }
///     Ok(TaskOutcome::empty())
/// }
/// ```
#[derive(Clone)]
pub struct SignalHandle {
    bus: Arc<dyn SignalBus>,
    run_id: Uuid,
    stop_requested: Arc<AtomicBool>,
}

impl SignalHandle {
    pub fn new(bus: Arc<dyn SignalBus>, run_id: Uuid) -> Self {
        Self {
            bus,
            run_id,
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a stop or abort covering this task's DAG has been seen
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Relaxed)
    }

    /// Ask the workflow scheduler to launch a non-autostart DAG
    pub async fn run_dag(
        &self,
        dag: impl Into<String>,
        seed: Option<Envelope>,
    ) -> Result<(), SignalError> {
        self.bus
            .publish(Signal::run_dag(self.run_id, dag, seed))
            .await
    }

    /// Publish an arbitrary signal on the run's channel
    pub async fn publish(&self, signal: Signal) -> Result<(), SignalError> {
        self.bus.publish(signal).await
    }

    /// Spawn the watcher that flips the stop flag on stop/abort signals
    ///
    /// The caller aborts the returned handle once the body finishes.
    pub(crate) fn watch(&self, dag: String) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let run_id = self.run_id;
        let flag = Arc::clone(&self.stop_requested);
        tokio::spawn(async move {
            let mut stream = bus.subscribe(run_id).await;
            while let Some(signal) = stream.recv().await {
                if signal.interrupts_dag(&dag) {
                    flag.store(true, Ordering::Relaxed);
                    return;
                }
            }
        })
    }

}

impl std::fmt::Debug for SignalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHandle")
            .field("run_id", &self.run_id)
            .field("stop_requested", &self.is_stop_requested())
            .finish_non_exhaustive()
    }
}

/// Everything a task body receives
#[derive(Debug)]
pub struct TaskContext {
    pub run_id: Uuid,
    pub dag: String,
    pub task: String,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Body-facing named view of the input envelope
    pub data: DataView,

    /// The raw merged input envelope, for bodies that forward slices
    /// (histories travel with the slices)
    pub input: Envelope,

    /// Run-scoped store handle; writes persist regardless of outcome
    pub store: StoreHandle,

    pub signals: SignalHandle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{InMemorySignalBus, SignalScope};
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_flag_flips_on_scoped_stop() {
        let bus: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
        let run_id = Uuid::now_v7();
        bus.open(run_id).await.unwrap();

        let handle = SignalHandle::new(Arc::clone(&bus), run_id);
        let watcher = handle.watch("main".to_string());
        assert!(!handle.is_stop_requested());

        bus.publish(Signal::stop(
            run_id,
            SignalScope::Dag {
                dag: "main".to_string(),
            },
        ))
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_stop_requested());
    }

    #[tokio::test]
    async fn test_stop_for_other_dag_is_ignored() {
        let bus: Arc<dyn SignalBus> = Arc::new(InMemorySignalBus::new());
        let run_id = Uuid::now_v7();
        bus.open(run_id).await.unwrap();

        let handle = SignalHandle::new(Arc::clone(&bus), run_id);
        let watcher = handle.watch("main".to_string());

        bus.publish(Signal::stop(
            run_id,
            SignalScope::Dag {
                dag: "other".to_string(),
            },
        ))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_stop_requested());
        watcher.abort();
    }
}
