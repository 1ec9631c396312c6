// src/middleware/request_size_limit.rs

use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

/// Rejects bodies whose declared length exceeds `server.request_body_limit_bytes`.
pub async fn request_size_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let limit = state.config.server.request_body_limit_bytes;
    if matches!(*request.method(), Method::POST | Method::PUT | Method::PATCH) {
        let declared = request
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if let Some(length) = declared.filter(|&l| l > limit) {
            warn!(
                content_length = length,
                max_size = limit,
                method = %request.method(),
                "Request rejected: body size exceeds limit"
            );
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }

    Ok(next.run(request).await)
}
