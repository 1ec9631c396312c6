// src/handlers/payment_required.rs

use super::base::{upstream_message, Action, ResponseHandler};
use crate::key_manager::DEFAULT_BAN_REASON;
use axum::{body::Bytes, http::StatusCode};

/// 402: the key has no credit left.
pub struct PaymentRequiredHandler;

impl ResponseHandler for PaymentRequiredHandler {
    fn handle(&self, status: StatusCode, body: &Bytes) -> Option<Action> {
        (status == StatusCode::PAYMENT_REQUIRED).then(|| Action::PaymentRequired {
            reason: upstream_message(body, DEFAULT_BAN_REASON),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_reason_when_body_is_empty() {
        let action = PaymentRequiredHandler.handle(StatusCode::PAYMENT_REQUIRED, &Bytes::new());
        assert_eq!(
            action,
            Some(Action::PaymentRequired {
                reason: DEFAULT_BAN_REASON.to_string()
            })
        );
    }

    #[test]
    fn test_reason_from_body() {
        let body = Bytes::from_static(br#"{"error":{"message":"Insufficient balance"}}"#);
        let action = PaymentRequiredHandler.handle(StatusCode::PAYMENT_REQUIRED, &body);
        assert_eq!(action.and_then(|a| a.reason().map(str::to_string)).as_deref(), Some("Insufficient balance"));
    }

    #[test]
    fn test_ignores_other_statuses() {
        assert!(PaymentRequiredHandler.handle(StatusCode::UNAUTHORIZED, &Bytes::new()).is_none());
    }
}
