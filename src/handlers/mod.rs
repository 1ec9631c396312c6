// src/handlers/mod.rs

pub mod base;
pub mod invalid_api_key;
pub mod payment_required;
pub mod processor;
pub mod proxy_loop;
pub mod rate_limit;
pub mod server_error;
pub mod success;
pub mod terminal_error;

use crate::{error::Result, state::AppState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use std::sync::Arc;

/// The parts of a client request the proxy loop needs on every attempt.
pub struct RequestContext<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
}

/// `ANY /v1/*path`
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let ctx = RequestContext {
        method,
        path: &path,
        query: uri.query(),
        headers: &headers,
        body,
    };
    proxy_loop::proxy_loop(&state, &ctx).await
}
