// src/storage/snapshot.rs

use crate::config::PoolConfig;
use crate::storage::{KeyRecord, KeyStatus, PoolGroup};
use serde::{Deserialize, Serialize};

/// Status counts derived from the live key list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub banned: usize,
}

impl PoolStats {
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a KeyRecord>) -> Self {
        keys.into_iter().fold(PoolStats::default(), |mut stats, key| {
            stats.total += 1;
            match key.status {
                KeyStatus::Active => stats.active += 1,
                KeyStatus::Disabled => stats.disabled += 1,
                KeyStatus::Banned => stats.banned += 1,
            }
            stats
        })
    }
}

/// The `stats` object of the pool file. Counts are informational and
/// recomputed on every save; only the rotation cursor is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(flatten)]
    pub counts: PoolStats,
    #[serde(default)]
    pub last_rotation_index: usize,
}

/// Everything that survives a restart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    #[serde(default)]
    pub keys: Vec<KeyRecord>,
    #[serde(default)]
    pub stats: PersistedStats,
    #[serde(default)]
    pub pool_groups: Vec<PoolGroup>,
    #[serde(default)]
    pub config: PoolConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_shape_matches_pool_file() {
        let stats = PersistedStats {
            counts: PoolStats {
                total: 3,
                active: 1,
                disabled: 1,
                banned: 1,
            },
            last_rotation_index: 2,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["total"], 3);
        assert_eq!(json["last_rotation_index"], 2);
    }

    #[test]
    fn test_empty_object_is_a_valid_snapshot() {
        let snapshot: PoolSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.keys.is_empty());
        assert_eq!(snapshot.config, PoolConfig::default());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("poolGroups").is_some());
    }
}
