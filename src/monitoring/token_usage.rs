// src/monitoring/token_usage.rs

use crate::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Upstream-reported token accounting for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub used: u64,
    pub remaining: u64,
    pub allowance: u64,
}

/// Key id to token accounting. Empty means "no data".
pub type TokenSnapshot = HashMap<String, TokenUsage>;

/// Source of token-usage data for the token-aware strategies.
pub trait TokenUsageProvider: Send + Sync {
    fn snapshot(&self) -> Arc<TokenSnapshot>;
}

/// In-memory snapshot, swapped as a whole whenever fresh data arrives.
#[derive(Debug, Default)]
pub struct TokenUsageStore {
    current: RwLock<Arc<TokenSnapshot>>,
}

impl TokenUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: TokenSnapshot) {
        *self.current.write() = Arc::new(snapshot);
    }

    /// Loads a JSON object of `{ "<key id>": { used, remaining, allowance } }`.
    pub async fn load_file(&self, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot: TokenSnapshot = serde_json::from_slice(&bytes)?;
        let count = snapshot.len();
        self.replace(snapshot);
        info!(path = %path.display(), keys = count, "Loaded token usage snapshot");
        Ok(count)
    }
}

impl TokenUsageProvider for TokenUsageStore {
    fn snapshot(&self) -> Arc<TokenSnapshot> {
        self.current.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_file_replaces_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(
            &path,
            r#"{"key_a": {"used": 10, "remaining": 90, "allowance": 100}}"#,
        )
        .unwrap();

        let store = TokenUsageStore::new();
        assert!(store.snapshot().is_empty());
        assert_eq!(store.load_file(&path).await.unwrap(), 1);
        assert_eq!(store.snapshot()["key_a"].remaining, 90);
    }
}
