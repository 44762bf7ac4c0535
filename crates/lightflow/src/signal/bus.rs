//! Signal bus trait and the in-process reference implementation

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Signal, SignalKind};

/// The well-known channel workers listen on for introspection queries
///
/// The bus is run-scoped; worker-level queries use the nil run id so they
/// never mix with run traffic.
pub const CONTROL_CHANNEL: Uuid = Uuid::nil();

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// No channel open for this run
    #[error("signal channel closed for run {0}")]
    ChannelClosed(Uuid),

    /// request() expired without a matching reply
    #[error("signal request timed out after {0:?}")]
    Timeout(Duration),

    /// Bus substrate unreachable or failing
    #[error("signal bus unavailable: {0}")]
    Unavailable(String),
}

/// A lazy stream of signals for one run
///
/// Terminates when the run's channel is closed.
pub struct SignalStream {
    inner: Pin<Box<dyn Stream<Item = Signal> + Send>>,
}

impl SignalStream {
    pub fn new(stream: impl Stream<Item = Signal> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// An already-terminated stream, for runs with no open channel
    pub fn closed() -> Self {
        Self::new(futures::stream::empty())
    }

    /// Next signal, or `None` once the channel is closed
    pub async fn recv(&mut self) -> Option<Signal> {
        self.inner.next().await
    }
}

/// Run-scoped pub/sub control channel
///
/// Delivery is best-effort to current subscribers; publish order from one
/// publisher is preserved per subscriber. The bus carries coordination
/// only — the job queue remains the authoritative work record.
#[async_trait]
pub trait SignalBus: Send + Sync + 'static {
    /// Open the channel for a run; idempotent
    async fn open(&self, run_id: Uuid) -> Result<(), SignalError>;

    /// Non-blocking, best-effort delivery to current subscribers
    async fn publish(&self, signal: Signal) -> Result<(), SignalError>;

    /// Subscribe to a run's channel
    ///
    /// Subscribing to a run with no open channel yields an immediately
    /// terminated stream.
    async fn subscribe(&self, run_id: Uuid) -> SignalStream;

    /// Publish with a correlation id and await the matching reply
    async fn request(&self, signal: Signal, timeout: Duration) -> Result<Signal, SignalError>;

    /// Close a run's channel, terminating its subscriber streams
    async fn close(&self, run_id: Uuid) -> Result<(), SignalError>;
}

/// In-process signal bus over per-run broadcast channels
pub struct InMemorySignalBus {
    channels: DashMap<Uuid, broadcast::Sender<Signal>>,
    capacity: usize,
}

impl InMemorySignalBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            capacity: 256,
        }
    }

    /// Set the per-channel buffer size
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Number of open channels
    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

impl Default for InMemorySignalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for InMemorySignalBus {
    async fn open(&self, run_id: Uuid) -> Result<(), SignalError> {
        self.channels
            .entry(run_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(())
    }

    async fn publish(&self, signal: Signal) -> Result<(), SignalError> {
        match self.channels.get(&signal.run_id) {
            Some(tx) => {
                // Err here only means no current subscriber; best-effort
                let receivers = tx.send(signal).unwrap_or(0);
                debug!(receivers, "published signal");
                Ok(())
            }
            None => {
                // Channel already closed (run finished or aborted); signals
                // from orphaned work are dropped by design of the contract
                debug!(run_id = %signal.run_id, "publish on closed channel, dropping");
                Ok(())
            }
        }
    }

    async fn subscribe(&self, run_id: Uuid) -> SignalStream {
        match self.channels.get(&run_id) {
            Some(tx) => {
                let rx = tx.subscribe();
                SignalStream::new(BroadcastStream::new(rx).filter_map(|item| async move {
                    match item {
                        Ok(signal) => Some(signal),
                        Err(err) => {
                            warn!("signal subscriber lagged: {err}");
                            None
                        }
                    }
                }))
            }
            None => SignalStream::closed(),
        }
    }

    async fn request(&self, signal: Signal, timeout: Duration) -> Result<Signal, SignalError> {
        let run_id = signal.run_id;
        if !self.channels.contains_key(&run_id) {
            return Err(SignalError::ChannelClosed(run_id));
        }

        let correlation = signal.correlation_id.unwrap_or_else(Uuid::now_v7);
        let signal = signal.with_correlation(correlation);

        // Subscribe before publishing so the reply cannot be missed
        let mut stream = self.subscribe(run_id).await;
        self.publish(signal).await?;

        let reply = tokio::time::timeout(timeout, async {
            while let Some(signal) = stream.recv().await {
                if signal.correlation_id == Some(correlation)
                    && matches!(signal.kind, SignalKind::QueryReply { .. })
                {
                    return Some(signal);
                }
            }
            None
        })
        .await
        .map_err(|_| SignalError::Timeout(timeout))?;

        reply.ok_or(SignalError::ChannelClosed(run_id))
    }

    async fn close(&self, run_id: Uuid) -> Result<(), SignalError> {
        self.channels.remove(&run_id);
        Ok(())
    }
}
