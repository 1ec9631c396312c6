// src/storage/mod.rs

pub mod file;
pub mod key_state;
pub mod memory;
pub mod pool_group;
pub mod snapshot;
pub mod traits;

pub use file::JsonFileStore;
pub use key_state::{preview_key, KeyRecord, KeyStatus, Provider, TestResult, UsageSample};
pub use memory::InMemoryStore;
pub use pool_group::{PoolGroup, PoolGroupStats, DEFAULT_POOL_GROUP};
pub use snapshot::{PersistedStats, PoolSnapshot, PoolStats};
pub use traits::PoolStore;
