// src/handlers/rate_limit.rs

use super::base::{upstream_message, Action, ResponseHandler};
use axum::{body::Bytes, http::StatusCode};

pub struct RateLimitHandler;

impl ResponseHandler for RateLimitHandler {
    fn handle(&self, status: StatusCode, body: &Bytes) -> Option<Action> {
        (status == StatusCode::TOO_MANY_REQUESTS).then(|| Action::RetryNextKey {
            reason: upstream_message(body, "Too Many Requests"),
        })
    }
}
