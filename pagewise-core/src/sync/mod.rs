//! Keeping the local position, the in-flight save and the remote authority
//! consistent.

mod queue;
mod reconcile;
mod retry;

pub use queue::{ProgressSaveQueue, SyncStatus};
pub use reconcile::{reconcile, Correction, Reconciler, Reconciliation};
pub use retry::{retry_with_backoff, RetryPolicy};
