// src/handlers/processor.rs

use crate::handlers::{
    base::{Action, ResponseHandler},
    invalid_api_key::InvalidApiKeyHandler,
    payment_required::PaymentRequiredHandler,
    rate_limit::RateLimitHandler,
    server_error::ServerErrorHandler,
    success::SuccessHandler,
    terminal_error::TerminalErrorHandler,
};
use axum::{body::Bytes, http::StatusCode};
use std::sync::Arc;
use tracing::trace;

/// Runs an upstream status through a chain of handlers. First match wins.
#[derive(Clone)]
pub struct ResponseProcessor {
    handlers: Arc<Vec<Box<dyn ResponseHandler>>>,
}

impl ResponseProcessor {
    pub fn new(handlers: Vec<Box<dyn ResponseHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Chain used by both the proxy and the health probe. The order matters:
    /// 402 and 401/403 must be seen before the generic 4xx fallback.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(SuccessHandler),
            Box::new(PaymentRequiredHandler),
            Box::new(InvalidApiKeyHandler),
            Box::new(RateLimitHandler),
            Box::new(ServerErrorHandler),
            Box::new(TerminalErrorHandler),
        ])
    }

    pub fn classify(&self, status: StatusCode, body: &Bytes) -> Action {
        let action = self
            .handlers
            .iter()
            .find_map(|handler| handler.handle(status, body))
            // 1xx/3xx never come out of a followed reqwest call; pass them through.
            .unwrap_or(Action::ReturnToClient);
        trace!(%status, ?action, "Classified upstream response");
        action
    }
}

impl Default for ResponseProcessor {
    fn default() -> Self {
        Self::standard()
    }
}
