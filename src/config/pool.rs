// src/config/pool.rs

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named key selection strategies accepted by `PoolConfig::algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
    WeightedScore,
    LeastTokenUsed,
    MaxRemaining,
    WeightedUsage,
    QuotaAware,
    TimeWindow,
}

impl Algorithm {
    pub const ALL: [Algorithm; 9] = [
        Algorithm::RoundRobin,
        Algorithm::Random,
        Algorithm::LeastUsed,
        Algorithm::WeightedScore,
        Algorithm::LeastTokenUsed,
        Algorithm::MaxRemaining,
        Algorithm::WeightedUsage,
        Algorithm::QuotaAware,
        Algorithm::TimeWindow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round-robin",
            Algorithm::Random => "random",
            Algorithm::LeastUsed => "least-used",
            Algorithm::WeightedScore => "weighted-score",
            Algorithm::LeastTokenUsed => "least-token-used",
            Algorithm::MaxRemaining => "max-remaining",
            Algorithm::WeightedUsage => "weighted-usage",
            Algorithm::QuotaAware => "quota-aware",
            Algorithm::TimeWindow => "time-window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| {
                let allowed: Vec<_> = Algorithm::ALL.iter().map(|a| a.as_str()).collect();
                AppError::validation(
                    "algorithm",
                    format!(
                        "Unknown algorithm '{s}'. Allowed values: {}",
                        allowed.join(", ")
                    ),
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            retry_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Total attempts an operation gets under this policy (first try included).
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries + 1
        } else {
            1
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoBanPolicy {
    pub enabled: bool,
    pub error_threshold: u32,
    #[serde(rename = "ban402")]
    pub ban_402: bool,
    #[serde(rename = "ban401")]
    pub ban_401: bool,
}

impl Default for AutoBanPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 5,
            ban_402: true,
            ban_401: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformanceLimits {
    pub concurrent_limit: usize,
    pub request_timeout_ms: u64,
    pub batch_pause_ms: u64,
}

impl Default for PerformanceLimits {
    fn default() -> Self {
        Self {
            concurrent_limit: 100,
            request_timeout_ms: 10_000,
            batch_pause_ms: 1_000,
        }
    }
}

impl PerformanceLimits {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiTierPolicy {
    pub enabled: bool,
    pub auto_fallback: bool,
}

impl Default for MultiTierPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaLimits {
    pub per_key_daily_limit: u64,
    pub per_key_monthly_limit: u64,
    pub warning_threshold: f64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            per_key_daily_limit: 1_000_000,
            per_key_monthly_limit: 30_000_000,
            warning_threshold: 0.8,
        }
    }
}

/// Process-wide pool tunables, persisted next to the key list.
///
/// Every nested struct carries `#[serde(default)]`, so a partial object in the
/// pool file is merged field by field over the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub algorithm: Algorithm,
    pub retry: RetryPolicy,
    pub auto_ban: AutoBanPolicy,
    pub performance: PerformanceLimits,
    pub multi_tier: MultiTierPolicy,
    pub quota: QuotaLimits,
    pub time_window_hours: u32,
    pub score_cache_ttl_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            retry: RetryPolicy::default(),
            auto_ban: AutoBanPolicy::default(),
            performance: PerformanceLimits::default(),
            multi_tier: MultiTierPolicy::default(),
            quota: QuotaLimits::default(),
            time_window_hours: 24,
            score_cache_ttl_ms: 300_000,
        }
    }
}

impl PoolConfig {
    pub fn score_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.score_cache_ttl_ms)
    }

    /// Applies a partial update and returns the merged copy. `self` is left untouched.
    pub fn merged(&self, patch: &PoolConfigPatch) -> Result<PoolConfig> {
        let mut next = self.clone();
        if let Some(name) = &patch.algorithm {
            next.algorithm = name.parse()?;
        }
        if let Some(retry) = &patch.retry {
            set(&mut next.retry.enabled, retry.enabled);
            set(&mut next.retry.max_retries, retry.max_retries);
            set(&mut next.retry.retry_delay_ms, retry.retry_delay_ms);
        }
        if let Some(auto_ban) = &patch.auto_ban {
            set(&mut next.auto_ban.enabled, auto_ban.enabled);
            set(&mut next.auto_ban.error_threshold, auto_ban.error_threshold);
            set(&mut next.auto_ban.ban_402, auto_ban.ban_402);
            set(&mut next.auto_ban.ban_401, auto_ban.ban_401);
        }
        if let Some(perf) = &patch.performance {
            set(&mut next.performance.concurrent_limit, perf.concurrent_limit);
            set(&mut next.performance.request_timeout_ms, perf.request_timeout_ms);
            set(&mut next.performance.batch_pause_ms, perf.batch_pause_ms);
        }
        if let Some(tier) = &patch.multi_tier {
            set(&mut next.multi_tier.enabled, tier.enabled);
            set(&mut next.multi_tier.auto_fallback, tier.auto_fallback);
        }
        if let Some(quota) = &patch.quota {
            set(&mut next.quota.per_key_daily_limit, quota.per_key_daily_limit);
            set(&mut next.quota.per_key_monthly_limit, quota.per_key_monthly_limit);
            set(&mut next.quota.warning_threshold, quota.warning_threshold);
        }
        set(&mut next.time_window_hours, patch.time_window_hours);
        set(&mut next.score_cache_ttl_ms, patch.score_cache_ttl_ms);
        Ok(next)
    }
}

fn set<T: Copy>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

/// Partial `PoolConfig` as accepted by `update_config`. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfigPatch {
    pub algorithm: Option<String>,
    pub retry: Option<RetryPatch>,
    pub auto_ban: Option<AutoBanPatch>,
    pub performance: Option<PerformancePatch>,
    pub multi_tier: Option<MultiTierPatch>,
    pub quota: Option<QuotaPatch>,
    pub time_window_hours: Option<u32>,
    pub score_cache_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPatch {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoBanPatch {
    pub enabled: Option<bool>,
    pub error_threshold: Option<u32>,
    #[serde(rename = "ban402")]
    pub ban_402: Option<bool>,
    #[serde(rename = "ban401")]
    pub ban_401: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PerformancePatch {
    pub concurrent_limit: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub batch_pause_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MultiTierPatch {
    pub enabled: Option<bool>,
    pub auto_fallback: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaPatch {
    pub per_key_daily_limit: Option<u64>,
    pub per_key_monthly_limit: Option<u64>,
    pub warning_threshold: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_round_trip() {
        for algorithm in Algorithm::ALL {
            assert_eq!(algorithm.as_str().parse::<Algorithm>().unwrap(), algorithm);
            let json = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(json, format!("\"{}\"", algorithm.as_str()));
        }
    }

    #[test]
    fn test_unknown_algorithm_lists_allowed_values() {
        let err = "fastest".parse::<Algorithm>().unwrap_err();
        match err {
            AppError::Validation { field, message } => {
                assert_eq!(field, "algorithm");
                assert!(message.contains("quota-aware"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_partial_persisted_config_merges_over_defaults() {
        let json = r#"{"algorithm":"random","retry":{"maxRetries":7}}"#;
        let config: PoolConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.algorithm, Algorithm::Random);
        assert_eq!(config.retry.max_retries, 7);
        assert!(config.retry.enabled, "nested defaults must survive");
        assert_eq!(config.retry.retry_delay_ms, 1000);
        assert_eq!(config.auto_ban, AutoBanPolicy::default());
    }

    #[test]
    fn test_patch_merges_field_by_field() {
        let base = PoolConfig::default();
        let patch = PoolConfigPatch {
            auto_ban: Some(AutoBanPatch {
                ban_401: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = base.merged(&patch).unwrap();
        assert!(merged.auto_ban.ban_401);
        assert!(merged.auto_ban.ban_402);
        assert_eq!(merged.auto_ban.error_threshold, 5);
        assert!(!base.auto_ban.ban_401);
    }

    #[test]
    fn test_retry_attempts() {
        let mut retry = RetryPolicy::default();
        assert_eq!(retry.attempts(), 4);
        retry.enabled = false;
        assert_eq!(retry.attempts(), 1);
    }
}
