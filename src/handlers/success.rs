// src/handlers/success.rs

use super::base::{Action, ResponseHandler};
use axum::{body::Bytes, http::StatusCode};

pub struct SuccessHandler;

impl ResponseHandler for SuccessHandler {
    fn handle(&self, status: StatusCode, _body: &Bytes) -> Option<Action> {
        status.is_success().then_some(Action::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StatusCode::OK, Some(Action::Success))]
    #[case(StatusCode::CREATED, Some(Action::Success))]
    #[case(StatusCode::BAD_REQUEST, None)]
    #[case(StatusCode::TOO_MANY_REQUESTS, None)]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, None)]
    fn test_success_handler(#[case] status: StatusCode, #[case] expected: Option<Action>) {
        assert_eq!(SuccessHandler.handle(status, &Bytes::new()), expected);
    }
}
