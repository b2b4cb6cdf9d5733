pub mod broker;
pub mod store;

pub use broker::{TaskBroker, TaskEnvelope, correlation_id};
pub use store::{DeadLetterTask, FjallQueue, QueueError, VerifyTask};
