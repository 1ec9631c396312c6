//! Environment-based overrides for the pool tunables.

use crate::config::pool::{Algorithm, PoolConfig};
use std::env;
use std::str::FromStr;
use tracing::warn;

/// `KEY_POOL_*` variables. Each present and parseable value wins over the
/// persisted pool config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvironmentConfig {
    pub algorithm: Option<Algorithm>,
    pub retry_enabled: Option<bool>,
    pub retry_max: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub auto_ban_enabled: Option<bool>,
    pub error_threshold: Option<u32>,
    pub ban_402: Option<bool>,
    pub ban_401: Option<bool>,
    pub concurrent_limit: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub batch_pause_ms: Option<u64>,
    pub multi_tier_enabled: Option<bool>,
    pub multi_tier_auto_fallback: Option<bool>,
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
    pub warning_threshold: Option<f64>,
    pub time_window_hours: Option<u32>,
    pub score_cache_ttl_ms: Option<u64>,
}

impl EnvironmentConfig {
    /// Load overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as `from_env` with an explicit lookup, used by tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse_bool = |name: &str| lookup(name).map(|v| parse_flag(&v));
        Self {
            algorithm: parsed(&lookup, "KEY_POOL_ALGORITHM"),
            retry_enabled: parse_bool("KEY_POOL_RETRY_ENABLED"),
            retry_max: parsed(&lookup, "KEY_POOL_RETRY_MAX"),
            retry_delay_ms: parsed(&lookup, "KEY_POOL_RETRY_DELAY_MS"),
            auto_ban_enabled: parse_bool("KEY_POOL_AUTO_BAN_ENABLED"),
            error_threshold: parsed(&lookup, "KEY_POOL_ERROR_THRESHOLD"),
            ban_402: parse_bool("KEY_POOL_BAN_402"),
            ban_401: parse_bool("KEY_POOL_BAN_401"),
            concurrent_limit: parsed(&lookup, "KEY_POOL_CONCURRENT_LIMIT"),
            request_timeout_ms: parsed(&lookup, "KEY_POOL_REQUEST_TIMEOUT_MS"),
            batch_pause_ms: parsed(&lookup, "KEY_POOL_BATCH_PAUSE_MS"),
            multi_tier_enabled: parse_bool("KEY_POOL_MULTI_TIER_ENABLED"),
            multi_tier_auto_fallback: parse_bool("KEY_POOL_MULTI_TIER_AUTO_FALLBACK"),
            daily_limit: parsed(&lookup, "KEY_POOL_DAILY_LIMIT"),
            monthly_limit: parsed(&lookup, "KEY_POOL_MONTHLY_LIMIT"),
            warning_threshold: parsed(&lookup, "KEY_POOL_WARNING_THRESHOLD"),
            time_window_hours: parsed(&lookup, "KEY_POOL_TIME_WINDOW_HOURS"),
            score_cache_ttl_ms: parsed(&lookup, "KEY_POOL_SCORE_CACHE_TTL_MS"),
        }
    }

    /// Check if any environment overrides are present
    pub fn has_overrides(&self) -> bool {
        *self != Self::default()
    }

    /// Layers the overrides on top of `config`.
    pub fn apply(&self, config: &mut PoolConfig) {
        apply(&mut config.algorithm, self.algorithm);
        apply(&mut config.retry.enabled, self.retry_enabled);
        apply(&mut config.retry.max_retries, self.retry_max);
        apply(&mut config.retry.retry_delay_ms, self.retry_delay_ms);
        apply(&mut config.auto_ban.enabled, self.auto_ban_enabled);
        apply(&mut config.auto_ban.error_threshold, self.error_threshold);
        apply(&mut config.auto_ban.ban_402, self.ban_402);
        apply(&mut config.auto_ban.ban_401, self.ban_401);
        apply(&mut config.performance.concurrent_limit, self.concurrent_limit);
        apply(&mut config.performance.request_timeout_ms, self.request_timeout_ms);
        apply(&mut config.performance.batch_pause_ms, self.batch_pause_ms);
        apply(&mut config.multi_tier.enabled, self.multi_tier_enabled);
        apply(&mut config.multi_tier.auto_fallback, self.multi_tier_auto_fallback);
        apply(&mut config.quota.per_key_daily_limit, self.daily_limit);
        apply(&mut config.quota.per_key_monthly_limit, self.monthly_limit);
        apply(&mut config.quota.warning_threshold, self.warning_threshold);
        apply(&mut config.time_window_hours, self.time_window_hours);
        apply(&mut config.score_cache_ttl_ms, self.score_cache_ttl_ms);
    }
}

fn apply<T: Copy>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(env.var = name, env.value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1")
}
