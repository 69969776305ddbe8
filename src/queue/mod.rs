//! Operation queue: mutations waiting to reach the remote.

mod operation;
mod pending;

pub use operation::{operation_id, EntityKind, OperationKind, OperationStatus, QueuedOperation};
pub use pending::{OperationQueue, DEFAULT_MAX_ATTEMPTS, QUEUE_KEY};
