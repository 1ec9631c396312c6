// src/handlers/proxy_loop.rs

use crate::{
    error::{AppError, Result},
    handlers::{base::Action, RequestContext},
    key_manager::SelectedKey,
    metrics, proxy,
    state::AppState,
};
use axum::{http::StatusCode, response::Response};
use std::sync::Arc;
use tracing::{info, warn};

/// Forwards one request, rotating keys on key-attributable failures.
///
/// Bounded by the retry policy; pool exhaustion surfaces as 503 from `next_key`.
pub async fn proxy_loop(state: &Arc<AppState>, ctx: &RequestContext<'_>) -> Result<Response> {
    let config = state.pool.config();
    let attempts = config.retry.attempts();
    let url = proxy::build_target_url(&state.config.upstream.base_url, ctx.path, ctx.query)?;
    let mut last_failure = String::from("no attempt made");
    // Статус последнего отказа по ключу (401/402), если попытка закончилась им.
    let mut last_rejection = None;

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(config.retry.delay()).await;
        }
        let selected = state.pool.next_key()?;
        info!(attempt, key.id = %selected.id, path = ctx.path, "Attempting upstream request");

        let upstream = match proxy::forward_request(
            &state.http_client,
            &selected.key,
            ctx.method.clone(),
            url.clone(),
            ctx.headers,
            ctx.body.clone(),
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                last_failure = format!("Network error: {e}");
                last_rejection = None;
                warn!(attempt, key.id = %selected.id, error = %e, "Upstream request failed");
                settle(
                    &selected,
                    state
                        .pool
                        .record_outcome(&selected.id, false, Some(last_failure.clone()))
                        .await,
                )?;
                continue;
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .map_err(|e| AppError::Internal(format!("upstream returned an invalid status: {e}")))?;
        metrics::record_upstream_status(status.as_u16());

        if status.is_success() && proxy::is_streaming(upstream.headers()) {
            settle(&selected, state.pool.record_outcome(&selected.id, true, None).await)?;
            return proxy::stream_response(upstream);
        }

        let headers = proxy::build_response_headers(upstream.headers());
        let body = upstream.bytes().await?;
        match state.response_processor.classify(status, &body) {
            Action::Success => {
                settle(&selected, state.pool.record_outcome(&selected.id, true, None).await)?;
                if let Some(tokens) = proxy::extract_usage_tokens(&body) {
                    settle(&selected, state.pool.record_token_usage(&selected.id, tokens))?;
                }
                return proxy::buffered_response(status, headers, body);
            }
            Action::ReturnToClient => return proxy::buffered_response(status, headers, body),
            Action::PaymentRequired { reason } => {
                last_failure = format!("{}: {}", status.as_u16(), reason);
                last_rejection = Some(status.as_u16());
                let ban = config.auto_ban.enabled && config.auto_ban.ban_402;
                reject_key(state, &selected, &reason, &last_failure, ban).await?;
            }
            Action::InvalidKey { reason } => {
                last_failure = format!("{}: {}", status.as_u16(), reason);
                last_rejection = Some(status.as_u16());
                let ban = config.auto_ban.enabled && config.auto_ban.ban_401;
                reject_key(state, &selected, &reason, &last_failure, ban).await?;
            }
            Action::RetryNextKey { reason } => {
                last_failure = format!("{}: {}", status.as_u16(), reason);
                last_rejection = None;
                warn!(attempt, key.id = %selected.id, status = status.as_u16(), "Transient upstream failure");
                settle(
                    &selected,
                    state
                        .pool
                        .record_outcome(&selected.id, false, Some(last_failure.clone()))
                        .await,
                )?;
            }
        }
    }

    warn!(attempts, last_failure = %last_failure, "All upstream attempts failed");
    match last_rejection {
        Some(status) => Err(AppError::UpstreamTerminal {
            status,
            message: last_failure,
        }),
        None => Err(AppError::UpstreamTransient(format!(
            "All {attempts} upstream attempts failed; last error: {last_failure}"
        ))),
    }
}

/// Records the failure and bans or disables a key the upstream refused,
/// per the auto-ban policy.
async fn reject_key(
    state: &AppState,
    selected: &SelectedKey,
    reason: &str,
    detail: &str,
    ban: bool,
) -> Result<()> {
    let outcome = state
        .pool
        .record_outcome(&selected.id, false, Some(detail.to_string()))
        .await;
    settle(selected, outcome)?;

    let status_change = if ban {
        state.pool.ban_key(&selected.id, Some(reason)).await
    } else {
        state.pool.disable_key(&selected.id, detail).await
    };
    settle(selected, status_change.map(|_| ()))
}

/// Bookkeeping after the upstream answered.
///
/// A key deleted while its request was in flight yields a business error
/// (`NotFound`); that is logged and dropped so the upstream result still
/// reaches the client. Infrastructure failures propagate.
fn settle(selected: &SelectedKey, result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_business() => {
            warn!(key.id = %selected.id, error = %e, "Key bookkeeping skipped");
            Ok(())
        }
        other => other,
    }
}
