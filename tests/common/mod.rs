// tests/common/mod.rs

//! Common test utilities and fixtures
#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use keypool_proxy::{
    config::{AppConfig, EnvironmentConfig},
    create_router,
    key_manager::TestOutcome,
    monitoring::{HttpProbe, TokenUsageStore, UpstreamProbe},
    state::build_http_client,
    storage::{InMemoryStore, JsonFileStore, KeyRecord, PoolStore},
    AppState, KeyPoolManager,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;

pub const ADMIN_TOKEN: &str = "test-admin-token";

/// Builder for test configurations
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = AppConfig::default();
        config.server.admin_token = Some(ADMIN_TOKEN.to_string());
        config.server.test_mode = true;
        config.storage.debounce_ms = 10;
        config.storage.write_retry_delay_ms = 1;
        config.upstream.connect_timeout_secs = 2;
        config.upstream.request_timeout_secs = 5;
        Self { config }
    }

    /// Points both the proxy and the health probe at a mock server.
    pub fn with_upstream(mut self, uri: &str) -> Self {
        self.config.upstream.base_url = format!("{uri}/v1");
        self.config.upstream.probe_url = format!("{uri}/v1/messages");
        self
    }

    pub fn with_admin_token(mut self, token: Option<&str>) -> Self {
        self.config.server.admin_token = token.map(str::to_string);
        self
    }

    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.config.server.request_body_limit_bytes = bytes;
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A router wired to real state over an in-memory pool.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<InMemoryStore>,
}

impl TestApp {
    pub async fn new(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new())).await
    }

    pub async fn with_store(config: AppConfig, store: Arc<InMemoryStore>) -> Self {
        let tokens = Arc::new(TokenUsageStore::new());
        let pool = KeyPoolManager::load(store.clone(), tokens.clone(), &EnvironmentConfig::default())
            .await
            .expect("pool loads");
        let http_client = build_http_client(&config.upstream).expect("http client");
        let upstream: Arc<dyn UpstreamProbe> = Arc::new(HttpProbe::new(http_client.clone(), &config.upstream));
        let state = Arc::new(AppState::from_parts(
            config,
            Arc::new(pool),
            tokens,
            upstream,
            http_client,
        ));
        Self {
            router: create_router(state.clone()),
            state,
            store,
        }
    }

    pub fn pool(&self) -> &Arc<KeyPoolManager> {
        &self.state.pool
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        use tower::util::ServiceExt;
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }
}

/// Admin request carrying the test token.
pub fn admin_request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-admin-key", ADMIN_TOKEN);
    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

pub async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

/// Adds a key and marks its health test as passed, making it selectable.
pub async fn add_tested_key(pool: &KeyPoolManager, credential: &str) -> KeyRecord {
    let record = pool.add_key(credential, "", None).await.expect("key added");
    pool.apply_test_outcome(&record.id, TestOutcome::Passed)
        .await
        .expect("test outcome applied")
}

/// Same as `add_tested_key`, placed in a pool group.
pub async fn add_tested_key_in(pool: &KeyPoolManager, credential: &str, group: &str) -> KeyRecord {
    let record = pool
        .add_key(credential, "", Some(group))
        .await
        .expect("key added");
    pool.apply_test_outcome(&record.id, TestOutcome::Passed)
        .await
        .expect("test outcome applied")
}

/// Pool backed by a JSON file under `dir`.
pub async fn file_backed_pool(dir: &TempDir) -> (KeyPoolManager, Arc<JsonFileStore>) {
    let store = Arc::new(
        JsonFileStore::new(dir.path().join("key_pool.json"))
            .with_retries(2, std::time::Duration::from_millis(1)),
    );
    let pool = KeyPoolManager::load(
        store.clone() as Arc<dyn PoolStore>,
        Arc::new(TokenUsageStore::new()),
        &EnvironmentConfig::default(),
    )
    .await
    .expect("pool loads");
    (pool, store)
}

/// Pool kept in memory, for tests that only exercise selection and lifecycle.
pub async fn memory_pool() -> (KeyPoolManager, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let pool = KeyPoolManager::load(
        store.clone(),
        Arc::new(TokenUsageStore::new()),
        &EnvironmentConfig::default(),
    )
    .await
    .expect("pool loads");
    (pool, store)
}
