// src/middleware/admin_auth.rs

use crate::{error::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Constant-time string comparison to prevent timing attacks
fn secure_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }
    result == 0
}

/// Token from `x-admin-key`, or from `Authorization: Bearer`.
fn presented_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
}

/// Guards `/admin`. With no configured token every request is rejected.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.admin_token() else {
        warn!("Admin request rejected: no admin token configured");
        return Err(AppError::Unauthorized);
    };

    match presented_token(req.headers()) {
        Some(token) if secure_compare(token, expected.expose_secret()) => {
            debug!(path = %req.uri().path(), "Admin authentication successful");
            Ok(next.run(req).await)
        }
        _ => {
            warn!(path = %req.uri().path(), "Admin authentication failed: invalid or missing token");
            Err(AppError::Unauthorized)
        }
    }
}
