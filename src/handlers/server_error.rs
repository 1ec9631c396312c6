// src/handlers/server_error.rs

use super::base::{upstream_message, Action, ResponseHandler};
use axum::{body::Bytes, http::StatusCode};

/// 5xx: upstream trouble, try the next key.
pub struct ServerErrorHandler;

impl ResponseHandler for ServerErrorHandler {
    fn handle(&self, status: StatusCode, body: &Bytes) -> Option<Action> {
        if !status.is_server_error() {
            return None;
        }
        let default = status.canonical_reason().unwrap_or("Upstream server error");
        Some(Action::RetryNextKey {
            reason: upstream_message(body, default),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_reason_fallback() {
        let action = ServerErrorHandler.handle(StatusCode::BAD_GATEWAY, &Bytes::from_static(b"upstream died"));
        assert_eq!(
            action,
            Some(Action::RetryNextKey {
                reason: "Bad Gateway".to_string()
            })
        );
    }
}
