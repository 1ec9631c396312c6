// src/state.rs

use crate::config::{AppConfig, EnvironmentConfig, UpstreamConfig};
use crate::error::Result;
use crate::handlers::processor::ResponseProcessor;
use crate::key_manager::KeyPoolManager;
use crate::monitoring::{HttpProbe, KeyHealthProbe, TokenUsageStore, UpstreamProbe};
use crate::storage::JsonFileStore;
use reqwest::Client;
use secrecy::Secret;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Shared state behind every axum handler.
pub struct AppState {
    pub config: AppConfig,
    pub pool: Arc<KeyPoolManager>,
    pub probe: KeyHealthProbe,
    pub token_usage: Arc<TokenUsageStore>,
    pub http_client: Client,
    pub response_processor: ResponseProcessor,
    admin_token: Option<Secret<String>>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<crate::metrics::PrometheusHandle>,
}

impl AppState {
    /// Builds the production state: file-backed pool, HTTP client and probe.
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Creating shared AppState");
        let http_client = build_http_client(&config.upstream)?;

        let token_usage = Arc::new(TokenUsageStore::new());
        if let Some(path) = &config.storage.token_usage_path {
            if let Err(e) = token_usage.load_file(path).await {
                warn!(path = %path.display(), error = %e, "Token usage snapshot not loaded; token-aware algorithms will fail open");
            }
        }

        let store = JsonFileStore::new(&config.storage.key_pool_path)
            .with_retries(config.storage.write_retries, config.storage.write_retry_delay());
        let pool = KeyPoolManager::load(Arc::new(store), token_usage.clone(), &EnvironmentConfig::from_env())
            .await?
            .with_notes_max_length(config.limits.notes_max_length);

        let upstream = Arc::new(HttpProbe::new(http_client.clone(), &config.upstream));
        Ok(Self::from_parts(config, Arc::new(pool), token_usage, upstream, http_client))
    }

    /// Assembles state from already-built parts.
    pub fn from_parts(
        config: AppConfig,
        pool: Arc<KeyPoolManager>,
        token_usage: Arc<TokenUsageStore>,
        upstream: Arc<dyn UpstreamProbe>,
        http_client: Client,
    ) -> Self {
        let admin_token = config
            .server
            .admin_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .map(Secret::new);
        if admin_token.is_none() {
            warn!("No admin token configured; /admin routes will reject every request");
        }
        Self {
            probe: KeyHealthProbe::new(pool.clone(), upstream),
            config,
            pool,
            token_usage,
            http_client,
            response_processor: ResponseProcessor::standard(),
            admin_token,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: crate::metrics::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn admin_token(&self) -> Option<&Secret<String>> {
        self.admin_token.as_ref()
    }
}

pub fn build_http_client(upstream: &UpstreamConfig) -> Result<Client> {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(upstream.connect_timeout_secs))
        .timeout(Duration::from_secs(upstream.request_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()?;
    Ok(client)
}
