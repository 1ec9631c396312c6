// src/storage/traits.rs

use crate::error::Result;
use crate::storage::PoolSnapshot;
use async_trait::async_trait;

/// Durable home of the pool state.
///
/// `save` either replaces the stored snapshot as a whole or fails; a reader
/// never observes a half-written snapshot.
#[async_trait]
pub trait PoolStore: Send + Sync {
    /// Returns `None` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<PoolSnapshot>>;

    async fn save(&self, snapshot: &PoolSnapshot) -> Result<()>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}
