// src/proxy.rs

use crate::error::{AppError, Result};
use crate::storage::preview_key;
use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::Response,
};
use futures_util::TryStreamExt;
use reqwest::Client;
use tracing::{debug, trace, warn};
use url::Url;

// Hop-by-hop headers plus everything that carries client credentials.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "authorization",
    "x-api-key",
    "x-admin-key",
];

/// Joins the upstream base URL with the path captured after `/v1/`.
pub fn build_target_url(base_url: &str, path: &str, query: Option<&str>) -> Result<Url> {
    let mut raw = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(q);
    }
    Url::parse(&raw).map_err(|e| AppError::Config(format!("Invalid upstream URL '{raw}': {e}")))
}

/// Sends the client's request upstream, authenticated with `credential`.
pub async fn forward_request(
    client: &Client,
    credential: &str,
    method: Method,
    url: Url,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<reqwest::Response> {
    let outgoing = build_forward_headers(headers, credential);
    debug!(%method, %url, key.preview = %preview_key(credential), "Forwarding request upstream");
    client
        .request(method, url)
        .headers(outgoing)
        .body(body)
        .send()
        .await
        .map_err(AppError::from)
}

/// Whether the upstream answered with a server-sent event stream.
pub fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"))
}

/// Passes a streamed upstream body straight through to the client.
pub fn stream_response(upstream: reqwest::Response) -> Result<Response> {
    let status = upstream.status();
    let headers = build_response_headers(upstream.headers());
    let stream = upstream.bytes_stream().map_err(move |e| {
        warn!(%status, error = %e, "Upstream body stream failed");
        AppError::UpstreamTransient(format!("Upstream body stream error (status {status}): {e}"))
    });
    let mut response = Response::builder().status(status).body(Body::from_stream(stream))?;
    *response.headers_mut() = headers;
    Ok(response)
}

pub fn buffered_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Result<Response> {
    let mut response = Response::builder().status(status).body(Body::from(body))?;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Total tokens reported in a JSON completion body, if any.
///
/// Understands `usage.total_tokens`, `input_tokens + output_tokens` and
/// `prompt_tokens + completion_tokens`.
pub fn extract_usage_tokens(body: &Bytes) -> Option<u64> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let usage = json.get("usage")?;
    let field = |name: &str| usage.get(name).and_then(serde_json::Value::as_u64);
    field("total_tokens")
        .or_else(|| Some(field("input_tokens")? + field("output_tokens")?))
        .or_else(|| Some(field("prompt_tokens")? + field("completion_tokens")?))
}

fn build_forward_headers(original: &HeaderMap, credential: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(original.len() + 1);
    copy_non_hop_by_hop_headers(original, &mut headers);
    match HeaderValue::from_str(&format!("Bearer {credential}")) {
        Ok(value) => {
            headers.insert(header::AUTHORIZATION, value);
        }
        Err(e) => warn!(error = %e, "Credential is not a valid header value; sending without it"),
    }
    headers
}

pub fn build_response_headers(original: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(original.len());
    copy_non_hop_by_hop_headers(original, &mut headers);
    headers
}

fn copy_non_hop_by_hop_headers(source: &HeaderMap, dest: &mut HeaderMap) {
    for (name, value) in source {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            trace!(header = %name, "Skipping hop-by-hop header");
        } else {
            dest.append(name.clone(), value.clone());
        }
    }
}
