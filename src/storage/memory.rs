// src/storage/memory.rs

use crate::error::{AppError, Result};
use crate::storage::{PoolSnapshot, PoolStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

/// In-memory pool store that keeps the last saved snapshot.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    snapshot: Mutex<Option<PoolSnapshot>>,
    saves: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: PoolSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Last snapshot written through `save`.
    pub fn stored(&self) -> Option<PoolSnapshot> {
        self.snapshot.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Makes every following `save` fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PoolStore for InMemoryStore {
    async fn load(&self) -> Result<Option<PoolSnapshot>> {
        trace!("InMemoryStore::load");
        Ok(self.snapshot.lock().clone())
    }

    async fn save(&self, snapshot: &PoolSnapshot) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Persistence {
                path: self.location(),
                attempts: 1,
                message: "writes disabled".to_string(),
            });
        }
        trace!(keys = snapshot.keys.len(), "InMemoryStore::save");
        *self.snapshot.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
