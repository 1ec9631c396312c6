// src/core/scoring.rs

use crate::storage::KeyRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

const SUCCESS_WEIGHT: f64 = 0.6;
const FRESHNESS_WEIGHT: f64 = 0.3;
const EXPERIENCE_WEIGHT: f64 = 0.1;
/// Freshness lost per idle hour; reaches zero after 25 hours.
const FRESHNESS_DECAY_PER_HOUR: f64 = 4.0;
/// A key that was never used is scored as if idle for a day.
const NEVER_USED_IDLE_HOURS: f64 = 24.0;

/// Composite 0..=100 score blending success rate, recency and experience.
pub fn composite_score(key: &KeyRecord, now: DateTime<Utc>) -> f64 {
    let success_rate = if key.total_requests > 0 {
        key.success_requests as f64 / key.total_requests as f64
    } else {
        0.0
    };

    let idle_hours = key
        .last_used_at
        .map(|t| ((now - t).num_milliseconds().max(0) as f64) / 3_600_000.0)
        .unwrap_or(NEVER_USED_IDLE_HOURS);
    let freshness = (100.0 - idle_hours * FRESHNESS_DECAY_PER_HOUR).max(0.0);

    let experience = (key.total_requests as f64 / 10.0).min(100.0);

    let score = success_rate * 100.0 * SUCCESS_WEIGHT
        + freshness * FRESHNESS_WEIGHT
        + experience * EXPERIENCE_WEIGHT;
    (score * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CachedScore {
    score: f64,
    computed_at: DateTime<Utc>,
}

/// Ephemeral per-key score cache. Never persisted; rebuilt lazily after a restart.
#[derive(Debug, Default, Clone)]
pub struct ScoreCache {
    entries: HashMap<String, CachedScore>,
}

impl ScoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached score if it was computed less than `ttl` ago.
    pub fn get(&self, key_id: &str, now: DateTime<Utc>, ttl: Duration) -> Option<f64> {
        let entry = self.entries.get(key_id)?;
        let age = (now - entry.computed_at).to_std().unwrap_or(Duration::ZERO);
        (age < ttl).then_some(entry.score)
    }

    pub fn insert(&mut self, key_id: impl Into<String>, score: f64, now: DateTime<Utc>) {
        self.entries.insert(
            key_id.into(),
            CachedScore {
                score,
                computed_at: now,
            },
        );
    }

    pub fn invalidate(&mut self, key_id: &str) {
        self.entries.remove(key_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
