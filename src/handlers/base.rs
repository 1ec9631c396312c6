// src/handlers/base.rs

use axum::body::Bytes;
use axum::http::StatusCode;

/// What the caller should do with the key after an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// 2xx. The key works.
    Success,
    /// 402. The key is out of credit.
    PaymentRequired { reason: String },
    /// 401/403. The upstream rejected the credential.
    InvalidKey { reason: String },
    /// 429 or 5xx. Worth retrying with another key.
    RetryNextKey { reason: String },
    /// Other 4xx. The request itself is wrong; the key is not to blame.
    ReturnToClient,
}

impl Action {
    /// Whether the response says something bad about the key.
    pub fn blames_key(&self) -> bool {
        matches!(
            self,
            Action::PaymentRequired { .. } | Action::InvalidKey { .. } | Action::RetryNextKey { .. }
        )
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Action::PaymentRequired { reason }
            | Action::InvalidKey { reason }
            | Action::RetryNextKey { reason } => Some(reason),
            Action::Success | Action::ReturnToClient => None,
        }
    }
}

/// One link of the classification chain.
pub trait ResponseHandler: Send + Sync {
    /// Returns `Some` when this handler owns `status`, `None` to pass it on.
    fn handle(&self, status: StatusCode, body: &Bytes) -> Option<Action>;
}

/// Pulls a human-readable message out of an upstream error body.
///
/// Looks at `error.message`, then a string `error`, then `message`, and
/// falls back to `default`.
pub fn upstream_message(body: &Bytes, default: &str) -> String {
    let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
        return default.to_string();
    };
    json.get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|m| m.as_str())
        .or_else(|| json.get("message").and_then(|m| m.as_str()))
        .filter(|m| !m.trim().is_empty())
        .map_or_else(|| default.to_string(), str::to_string)
}
