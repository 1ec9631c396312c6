// src/storage/key_state.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a pooled key. No other value is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Disabled,
    Banned,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Disabled => "disabled",
            KeyStatus::Banned => "banned",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for KeyStatus {
    type Err = crate::error::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "disabled" => Ok(KeyStatus::Disabled),
            "banned" => Ok(KeyStatus::Banned),
            other => Err(crate::error::AppError::validation(
                "status",
                format!("Unknown status '{other}'. Allowed values: active, disabled, banned"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    #[default]
    Untested,
    Success,
    Failed,
}

/// Upstream family, detected from the credential prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Factory,
    Anthropic,
    Openai,
}

impl Provider {
    /// Returns `None` for credentials outside the known prefix taxonomy.
    pub fn detect(credential: &str) -> Option<Provider> {
        // Longest prefix first: `sk-ant-` is also an `sk-` key.
        if credential.starts_with("fk-") {
            Some(Provider::Factory)
        } else if credential.starts_with("sk-ant-") {
            Some(Provider::Anthropic)
        } else if credential.starts_with("sk-") {
            Some(Provider::Openai)
        } else {
            None
        }
    }
}

/// One entry of the sliding time-window history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tokens_used: u64,
}

/// One pooled upstream credential and its bookkeeping.
///
/// Fields added after the first release carry `#[serde(default)]` so older
/// pool files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub pool_group: Option<String>,
    #[serde(default)]
    pub notes: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub last_test_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_test_result: TestResult,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub consecutive_errors: u32,

    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub success_requests: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub banned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub banned_reason: Option<String>,

    /// `YYYY-MM-DD` to selections made that day.
    #[serde(default)]
    pub daily_usage: BTreeMap<String, u64>,
    #[serde(default)]
    pub usage_history: Vec<UsageSample>,
}

impl KeyRecord {
    pub fn new(id: String, key: String, provider: Provider, now: DateTime<Utc>) -> Self {
        Self {
            id,
            key,
            provider,
            pool_group: None,
            notes: String::new(),
            status: KeyStatus::Active,
            created_at: now,
            last_test_at: None,
            last_test_result: TestResult::Untested,
            last_error: None,
            error_count: 0,
            consecutive_errors: 0,
            usage_count: 0,
            total_requests: 0,
            success_requests: 0,
            success_rate: 0.0,
            last_used_at: None,
            banned_at: None,
            banned_reason: None,
            daily_usage: BTreeMap::new(),
            usage_history: Vec::new(),
        }
    }

    /// Active and last health test passed.
    pub fn is_eligible(&self) -> bool {
        self.status == KeyStatus::Active && self.last_test_result == TestResult::Success
    }

    /// Group id used for tiering. Missing or empty groups fall into `default`.
    pub fn group_id(&self) -> &str {
        match self.pool_group.as_deref() {
            Some(g) if !g.is_empty() => g,
            _ => crate::storage::DEFAULT_POOL_GROUP,
        }
    }

    /// Sets a new status. Leaving `banned` clears the ban metadata.
    pub fn set_status(&mut self, status: KeyStatus) {
        if self.status == KeyStatus::Banned && status != KeyStatus::Banned {
            self.banned_at = None;
            self.banned_reason = None;
        }
        self.status = status;
    }

    pub fn ban(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = KeyStatus::Banned;
        self.banned_at = Some(now);
        self.banned_reason = Some(reason.into());
    }

    /// Records one finished upstream request.
    pub fn record_outcome(&mut self, success: bool, detail: Option<String>) {
        self.total_requests += 1;
        if success {
            self.success_requests += 1;
            self.consecutive_errors = 0;
        } else {
            self.error_count = self.error_count.saturating_add(1);
            self.consecutive_errors = self.consecutive_errors.saturating_add(1);
            if detail.is_some() {
                self.last_error = detail;
            }
        }
        self.success_rate = self.success_requests as f64 / self.total_requests as f64;
    }

    pub fn daily_used(&self, day: &str) -> u64 {
        self.daily_usage.get(day).copied().unwrap_or(0)
    }

    /// Tokens attributed to samples newer than `since`.
    pub fn window_tokens(&self, since: DateTime<Utc>) -> u64 {
        self.usage_history
            .iter()
            .filter(|s| s.timestamp >= since)
            .map(|s| s.tokens_used)
            .sum()
    }

    /// `first4...last4`, safe for logs.
    pub fn preview(&self) -> String {
        preview_key(&self.key)
    }
}

pub fn preview_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}
