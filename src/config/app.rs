// src/config/app.rs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Token required by the `/admin` routes. Admin stays locked when unset.
    #[serde(default)]
    pub admin_token: Option<String>,
    #[serde(default = "default_request_body_limit")]
    pub request_body_limit_bytes: usize,
    #[serde(default)]
    pub test_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            admin_token: None,
            request_body_limit_bytes: default_request_body_limit(),
            test_mode: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_key_pool_path")]
    pub key_pool_path: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_write_retry_delay_ms")]
    pub write_retry_delay_ms: u64,
    /// Optional JSON snapshot of per-key token usage loaded at startup.
    #[serde(default)]
    pub token_usage_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_pool_path: default_key_pool_path(),
            debounce_ms: default_debounce_ms(),
            write_retries: default_write_retries(),
            write_retry_delay_ms: default_write_retry_delay_ms(),
            token_usage_path: None,
        }
    }
}

impl StorageConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct UpstreamConfig {
    /// Base URL every proxied `/v1/*` path is appended to.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Endpoint hit by the health probe.
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_model")]
    pub probe_model: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_proxy_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            probe_url: default_probe_url(),
            probe_model: default_probe_model(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_proxy_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_notes_max_length")]
    pub notes_max_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            notes_max_length: default_notes_max_length(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_key_pool_path() -> PathBuf {
    PathBuf::from("data/key_pool.json")
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_write_retries() -> u32 {
    3
}

fn default_write_retry_delay_ms() -> u64 {
    500
}

fn default_base_url() -> String {
    "https://app.factory.ai/api/llm/o/v1".to_string()
}

fn default_probe_url() -> String {
    "https://app.factory.ai/api/llm/a/v1/messages".to_string()
}

fn default_probe_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_proxy_timeout() -> u64 {
    300
}

fn default_notes_max_length() -> usize {
    1000
}
