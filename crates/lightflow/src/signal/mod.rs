//! Run-scoped control channel: completion, introspection, stop and abort

mod bus;
mod message;

pub use bus::{InMemorySignalBus, SignalBus, SignalError, SignalStream, CONTROL_CHANNEL};
pub use message::{FailureSummary, QueryTarget, Signal, SignalKind, SignalScope};
