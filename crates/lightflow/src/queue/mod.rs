//! Job queue abstraction: typed jobs on named queues with ack semantics

mod broker;
mod job;

pub use broker::{DeadLetter, InMemoryBroker, JobQueue, Lease, LeaseToken, QueueError};
pub use job::{JobPayload, JobRecord, QueueName};
