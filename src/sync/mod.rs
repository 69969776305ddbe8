//! Queue draining, full refresh and the status surface.

mod backoff;
mod dispatch;
mod engine;
mod reconcile;
mod refresh;
mod status;

pub use backoff::RetryPolicy;
pub use dispatch::{DispatchTable, Handler};
pub use engine::{DrainResult, SyncEngine, LAST_SYNC_KEY};
pub use reconcile::apply_confirmation;
pub use refresh::{Source, REFRESH_PLAN};
pub use status::{Listener, Subscription, SyncStatus, MAX_REPORTED_ERRORS};
