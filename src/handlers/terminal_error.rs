// src/handlers/terminal_error.rs

use super::base::{Action, ResponseHandler};
use axum::{body::Bytes, http::StatusCode};

/// Remaining 4xx. Goes back to the client untouched.
pub struct TerminalErrorHandler;

impl ResponseHandler for TerminalErrorHandler {
    fn handle(&self, status: StatusCode, _body: &Bytes) -> Option<Action> {
        status.is_client_error().then_some(Action::ReturnToClient)
    }
}
