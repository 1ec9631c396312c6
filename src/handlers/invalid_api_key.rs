// src/handlers/invalid_api_key.rs

use super::base::{upstream_message, Action, ResponseHandler};
use axum::{body::Bytes, http::StatusCode};

pub struct InvalidApiKeyHandler;

impl ResponseHandler for InvalidApiKeyHandler {
    fn handle(&self, status: StatusCode, body: &Bytes) -> Option<Action> {
        let default = match status {
            StatusCode::UNAUTHORIZED => "Unauthorized - Invalid API key",
            StatusCode::FORBIDDEN => "Forbidden - Key rejected",
            _ => return None,
        };
        Some(Action::InvalidKey {
            reason: upstream_message(body, default),
        })
    }
}
