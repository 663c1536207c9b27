//! Persistent reconciliation state.
//!
//! Tracks what the provider created for each resource id, the naming suffix
//! reused across runs, and a short run history. Guarded by a lock while
//! `apply` or `destroy` runs.

mod local;
mod lock;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use store::StateStore;
pub use types::{
    generate_suffix, HistoryEntry, Operation, ReconcileState, ResourceState, STATE_VERSION,
};
