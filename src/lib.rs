// src/lib.rs

// --- Модули ---
pub mod admin;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod key_manager;
pub mod metrics;
pub mod middleware;
pub mod monitoring;
pub mod proxy;
pub mod state;
pub mod storage;

// --- Зависимости и пере-экспорты ---
use crate::handlers::proxy_handler;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request as AxumRequest},
    response::{IntoResponse, Json},
    routing::{any, get},
    Router,
};
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Instant};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use key_manager::KeyPoolManager;
pub use state::AppState;

/// Создает основной роутер Axum для приложения.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/*path", any(proxy_handler))
        .merge(admin::admin_routes(state.clone()))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::request_size_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

/// `GET /health`
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "keys": state.pool.stats(),
    }))
}

/// `GET /metrics` in Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    #[cfg(feature = "metrics")]
    if let Some(handle) = &state.metrics {
        return (axum::http::StatusCode::OK, handle.render());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = state;
    (
        axum::http::StatusCode::NOT_FOUND,
        "metrics recorder is not installed\n".to_string(),
    )
}

/// Middleware для добавления Request ID и трассировки запросов.
async fn trace_requests(
    mut req: AxumRequest<Body>,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    req.extensions_mut().insert(request_id);

    async move {
        let mut response = next.run(req).await;
        let elapsed = start_time.elapsed();

        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("X-Request-ID", value);
        }

        info!(
            http.response.duration = ?elapsed,
            http.status_code = response.status().as_u16(),
            "Finished processing request"
        );

        response
    }
    .instrument(span)
    .await
}

/// Основная функция настройки приложения: конфигурация, состояние, роутер.
pub async fn run(config_path_override: Option<PathBuf>) -> Result<(Router, Arc<AppState>)> {
    info!("Starting key pool proxy...");

    let app_config = setup_configuration(config_path_override)?;
    let app_state = build_application_state(app_config).await?;
    let app = create_router(app_state.clone());

    Ok((app, app_state))
}

/// Загружает, валидирует и логирует конфигурацию приложения.
pub fn setup_configuration(config_path_override: Option<PathBuf>) -> Result<AppConfig> {
    let config_path = config_path_override.unwrap_or_else(|| {
        std::env::var("CONFIG_PATH").map_or_else(|_| PathBuf::from("config.yaml"), PathBuf::from)
    });

    let config_path_display = config_path.display().to_string();
    let app_config = config::load_config(&config_path).map_err(|e| {
        error!(
            config.path = %config_path_display,
            error = ?e,
            "Failed to load or validate configuration. Exiting."
        );
        e
    })?;

    info!(
        config.path = %config_path_display,
        server.port = app_config.server.port,
        storage.key_pool_path = %app_config.storage.key_pool_path.display(),
        upstream.base_url = %app_config.upstream.base_url,
        "Configuration loaded and validated successfully."
    );

    Ok(app_config)
}

async fn build_application_state(app_config: AppConfig) -> Result<Arc<AppState>> {
    let app_state = AppState::new(app_config).await.map_err(|e| {
        error!(error = ?e, "Failed to initialize application state. Exiting.");
        e
    })?;

    #[cfg(feature = "metrics")]
    let app_state = match metrics::initialize_metrics() {
        Ok(handle) => app_state.with_metrics(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder unavailable; /metrics disabled");
            app_state
        }
    };
    #[cfg(not(feature = "metrics"))]
    warn!("Built without the `metrics` feature; /metrics disabled");

    info!("Application state initialized successfully.");
    Ok(Arc::new(app_state))
}
