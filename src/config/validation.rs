// src/config/validation.rs

use crate::config::{AppConfig, PoolConfig};
use crate::error::{AppError, Result};
use std::ops::RangeInclusive;
use tracing::{debug, warn};
use url::Url;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        debug!("Starting configuration validation");

        if let Err(e) = Self::validate_server_config(config) {
            warn!("Server config validation failed: {}", e);
            return Err(e);
        }
        debug!("Server config validation passed");

        if let Err(e) = Self::validate_storage_config(config) {
            warn!("Storage config validation failed: {}", e);
            return Err(e);
        }
        debug!("Storage config validation passed");

        if let Err(e) = Self::validate_upstream_config(config) {
            warn!("Upstream config validation failed: {}", e);
            return Err(e);
        }

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_server_config(config: &AppConfig) -> Result<()> {
        // Allow port 0 in test mode (system will assign a free port)
        if config.server.port == 0 && !config.server.test_mode {
            return Err(AppError::validation(
                "server.port",
                "Server port cannot be 0 (except in test mode)",
            ));
        }
        if config.server.request_body_limit_bytes == 0 {
            return Err(AppError::validation(
                "server.request_body_limit_bytes",
                "Request body limit cannot be 0",
            ));
        }
        if let Some(token) = &config.server.admin_token {
            if token.trim().len() < 8 {
                warn!("Admin token is shorter than 8 characters");
            }
        }
        Ok(())
    }

    fn validate_storage_config(config: &AppConfig) -> Result<()> {
        if config.storage.key_pool_path.as_os_str().is_empty() {
            return Err(AppError::validation(
                "storage.key_pool_path",
                "Key pool path cannot be empty",
            ));
        }
        if config.storage.write_retries == 0 {
            return Err(AppError::validation(
                "storage.write_retries",
                "At least one write attempt is required",
            ));
        }
        if config.limits.notes_max_length == 0 {
            return Err(AppError::validation(
                "limits.notes_max_length",
                "Notes limit cannot be 0",
            ));
        }
        Ok(())
    }

    fn validate_upstream_config(config: &AppConfig) -> Result<()> {
        Self::validate_url(&config.upstream.base_url, "upstream.base_url")?;
        Self::validate_url(&config.upstream.probe_url, "upstream.probe_url")?;
        if config.upstream.connect_timeout_secs == 0 {
            return Err(AppError::validation(
                "upstream.connect_timeout_secs",
                "Connect timeout cannot be 0",
            ));
        }
        Ok(())
    }

    fn validate_url(url_str: &str, field_name: &str) -> Result<()> {
        let url = Url::parse(url_str).map_err(|e| {
            AppError::validation(field_name, format!("Invalid URL '{url_str}': {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::validation(
                field_name,
                format!("Unsupported scheme '{}'", url.scheme()),
            ));
        }
        Ok(())
    }

    /// Range checks for the pool tunables. Run on every candidate config
    /// before it replaces the live one.
    pub fn validate_pool(config: &PoolConfig) -> Result<()> {
        check_range("retry.maxRetries", config.retry.max_retries, 0..=10)?;
        check_range("retry.retryDelayMs", config.retry.retry_delay_ms, 0..=60_000)?;
        check_range("autoBan.errorThreshold", config.auto_ban.error_threshold, 1..=100)?;
        check_range(
            "performance.concurrentLimit",
            config.performance.concurrent_limit,
            1..=1000,
        )?;
        check_range(
            "performance.requestTimeoutMs",
            config.performance.request_timeout_ms,
            1000..=120_000,
        )?;
        check_range(
            "performance.batchPauseMs",
            config.performance.batch_pause_ms,
            0..=60_000,
        )?;
        check_range(
            "quota.perKeyDailyLimit",
            config.quota.per_key_daily_limit,
            1..=u64::MAX,
        )?;
        if config.quota.per_key_monthly_limit < config.quota.per_key_daily_limit {
            return Err(AppError::validation(
                "quota.perKeyMonthlyLimit",
                "Monthly limit must be at least the daily limit",
            ));
        }
        let threshold = config.quota.warning_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold.is_nan() {
            return Err(AppError::validation(
                "quota.warningThreshold",
                format!("Warning threshold must be between 0 and 1, got {threshold}"),
            ));
        }
        check_range("timeWindowHours", config.time_window_hours, 1..=720)?;
        check_range("scoreCacheTtlMs", config.score_cache_ttl_ms, 0..=3_600_000)?;
        Ok(())
    }
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(AppError::validation(
            field,
            format!(
                "{field} must be between {} and {}, got {value}",
                range.start(),
                range.end()
            ),
        ))
    }
}
