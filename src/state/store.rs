//! State store trait.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::ReconcileState;
use crate::error::Result;

/// Persistent storage for reconciliation state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the state, or `None` if nothing was saved yet.
    async fn load(&self) -> Result<Option<ReconcileState>>;

    /// Saves the state atomically.
    async fn save(&self, state: &ReconcileState) -> Result<()>;

    /// Deletes the state and any lock.
    async fn delete(&self) -> Result<()>;

    /// Acquires the state lock for `operation`.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock regardless of who holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Current lock, if any.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Where the state lives, for display.
    fn location(&self) -> String;
}
