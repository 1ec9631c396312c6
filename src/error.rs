// src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// Представляет структурированное тело ответа об ошибке.
#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: ErrorDetails,
}

/// Содержит детали ошибки для тела ответа.
#[derive(Serialize, Debug)]
struct ErrorDetails {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Why `next_key` could not produce a key.
///
/// Each variant renders a message an operator can act on: add keys, run the
/// health tests, raise quotas, or fix the tier layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// The pool holds no keys at all.
    EmptyPool,
    /// Keys exist, but none is both `active` and tested successfully.
    NoneEligible {
        total: usize,
        active: usize,
        untested: usize,
    },
    /// Every eligible key is at or over its quota ceiling.
    QuotaExceeded { candidates: usize },
    /// Tier filtering left nothing to pick from.
    TierEmpty { group: String },
    /// A strategy was handed an empty candidate set.
    NoCandidates,
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPool => write!(f, "no keys in the pool; add keys first"),
            Self::NoneEligible {
                total,
                active,
                untested,
            } => write!(
                f,
                "{total} keys in the pool but none is active with a passing health test \
                 ({active} active, {untested} of them untested); run the key tests"
            ),
            Self::QuotaExceeded { candidates } => write!(
                f,
                "all {candidates} eligible keys have reached their quota limit"
            ),
            Self::TierEmpty { group } => write!(
                f,
                "no pool tier has eligible keys (stopped at pool group '{group}')"
            ),
            Self::NoCandidates => write!(f, "no eligible candidates left after filtering"),
        }
    }
}

/// Представляет возможные ошибки, которые могут возникнуть в приложении.
///
/// Реализует `IntoResponse` для автоматического преобразования ошибок в
/// соответствующие HTTP-ответы с стандартизированным телом JSON.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reqwest HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    YamlParsing(#[from] serde_yaml::Error),

    #[error("JSON processing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    DuplicateKey(String),

    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Key pool exhausted: {0}")]
    PoolExhausted(ExhaustionReason),

    #[error("Transient upstream failure: {0}")]
    UpstreamTransient(String),

    #[error("Upstream rejected the key: {status} - {message}")]
    UpstreamTerminal { status: u16, message: String },

    #[error("Failed to persist key pool to '{path}' after {attempts} attempts: {message}")]
    Persistence {
        path: String,
        attempts: u32,
        message: String,
    },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("HTTP response builder error: {0}")]
    HttpResponseBuilder(#[from] http::Error),

    #[error("Axum error: {0}")]
    Axum(#[from] axum::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self::NotFound(format!("{what} '{id}' not found"))
    }

    /// Business failures are expected and handled near the boundary.
    /// Everything else is an infrastructure fault.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::DuplicateKey(_)
                | Self::Validation { .. }
                | Self::PoolExhausted(_)
        )
    }

    fn to_status_and_details(&self) -> (StatusCode, ErrorDetails) {
        match self {
            // --- 4xx Клиентские ошибки ---
            Self::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorDetails {
                    error_type: "NOT_FOUND".to_string(),
                    message: msg.clone(),
                    details: None,
                },
            ),
            Self::DuplicateKey(msg) => (
                StatusCode::CONFLICT,
                ErrorDetails {
                    error_type: "DUPLICATE".to_string(),
                    message: msg.clone(),
                    details: None,
                },
            ),
            Self::Validation { field, message } => (
                StatusCode::BAD_REQUEST,
                ErrorDetails {
                    error_type: "VALIDATION_ERROR".to_string(),
                    message: message.clone(),
                    details: Some(format!("field: {field}")),
                },
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorDetails {
                    error_type: "UNAUTHORIZED".to_string(),
                    message: "Missing or invalid admin credentials".to_string(),
                    details: None,
                },
            ),

            // --- 5xx Деградация сервиса ---
            Self::PoolExhausted(reason) => {
                warn!(reason = %reason, "Key pool exhausted");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorDetails {
                        error_type: "POOL_EXHAUSTED".to_string(),
                        message: reason.to_string(),
                        details: None,
                    },
                )
            }
            Self::UpstreamTransient(msg) => {
                warn!("Upstream transient failure: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorDetails {
                        error_type: "UPSTREAM_UNAVAILABLE".to_string(),
                        message: "Upstream service is temporarily unavailable".to_string(),
                        details: Some(msg.clone()),
                    },
                )
            }
            Self::UpstreamTerminal { status, message } => {
                warn!(upstream.status = status, "Upstream rejected request: {}", message);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorDetails {
                        error_type: "UPSTREAM_REJECTED".to_string(),
                        message: format!("Upstream responded with status {status}"),
                        details: Some(message.clone()),
                    },
                )
            }
            Self::Reqwest(e) => {
                error!("Reqwest error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    ErrorDetails {
                        error_type: "UPSTREAM_ERROR".to_string(),
                        message: "Error communicating with upstream service".to_string(),
                        details: None,
                    },
                )
            }

            // --- 5xx Серверные ошибки (детали только в логах) ---
            Self::Persistence {
                path,
                attempts,
                message,
            } => {
                error!(
                    storage.path = %path,
                    attempts = attempts,
                    "Key pool persistence failed: {}",
                    message
                );
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "PERSISTENCE_ERROR".to_string(),
                        message: "Failed to persist key pool state".to_string(),
                        details: None,
                    },
                )
            }
            Self::Config(msg) => {
                error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "CONFIG_ERROR".to_string(),
                        message: "Internal server configuration error".to_string(),
                        details: None,
                    },
                )
            }
            Self::Io(e) => {
                error!("IO error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "IO_ERROR".to_string(),
                        message: "Internal server error during IO operation".to_string(),
                        details: None,
                    },
                )
            }
            Self::YamlParsing(e) => {
                error!("YAML parsing error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "CONFIG_PARSE_ERROR".to_string(),
                        message: "Failed to parse configuration file".to_string(),
                        details: None,
                    },
                )
            }
            Self::Json(e) => {
                error!("JSON processing error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "JSON_ERROR".to_string(),
                        message: "Internal error while processing JSON".to_string(),
                        details: None,
                    },
                )
            }
            Self::HttpResponseBuilder(e) => {
                error!("HTTP response builder error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "RESPONSE_BUILD_ERROR".to_string(),
                        message: "Internal error while building the response".to_string(),
                        details: None,
                    },
                )
            }
            Self::Axum(e) => {
                error!("Internal Axum error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "INTERNAL_SERVER_ERROR".to_string(),
                        message: "An unexpected internal server error occurred".to_string(),
                        details: None,
                    },
                )
            }
            Self::Internal(msg) => {
                error!("Internal server error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorDetails {
                        error_type: "INTERNAL_SERVER_ERROR".to_string(),
                        message: "An unexpected internal server error occurred".to_string(),
                        details: None,
                    },
                )
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, details) = self.to_status_and_details();
        (status, Json(ErrorResponse { error: details })).into_response()
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field_errors = errors.field_errors();
        let mut fields: Vec<_> = field_errors.keys().map(|f| f.to_string()).collect();
        fields.sort();
        let field = fields.first().cloned().unwrap_or_else(|| "request".to_string());
        let message = field_errors
            .get(field.as_str())
            .and_then(|errs| errs.first())
            .map(|e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| format!("invalid value ({})", e.code))
            })
            .unwrap_or_else(|| errors.to_string());
        Self::Validation { field, message }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn check_response(
        error: AppError,
        expected_status: StatusCode,
        expected_type: &str,
    ) -> Value {
        let response = error.into_response();
        assert_eq!(response.status(), expected_status);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], expected_type);
        json
    }

    #[tokio::test]
    async fn test_business_errors_map_to_client_statuses() {
        check_response(
            AppError::not_found("Key", "key_1"),
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
        )
        .await;
        check_response(
            AppError::DuplicateKey("Key already exists".into()),
            StatusCode::CONFLICT,
            "DUPLICATE",
        )
        .await;
        let json = check_response(
            AppError::validation("notes", "too long"),
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
        )
        .await;
        assert_eq!(json["error"]["details"], "field: notes");
    }

    #[tokio::test]
    async fn test_pool_exhausted_is_service_unavailable_with_reason() {
        let json = check_response(
            AppError::PoolExhausted(ExhaustionReason::NoneEligible {
                total: 3,
                active: 2,
                untested: 2,
            }),
            StatusCode::SERVICE_UNAVAILABLE,
            "POOL_EXHAUSTED",
        )
        .await;
        let message = json["error"]["message"].as_str().unwrap();
        assert!(message.contains("3 keys"), "message was: {message}");
        assert!(message.contains("run the key tests"));
    }

    #[tokio::test]
    async fn test_persistence_error_hides_internal_details() {
        let json = check_response(
            AppError::Persistence {
                path: "/secret/path.json".into(),
                attempts: 3,
                message: "disk full".into(),
            },
            StatusCode::INTERNAL_SERVER_ERROR,
            "PERSISTENCE_ERROR",
        )
        .await;
        assert!(json["error"]["details"].is_null());
        assert!(!json.to_string().contains("/secret/path.json"));
    }

    #[test]
    fn test_exhaustion_messages_distinguish_empty_from_untested() {
        let empty = ExhaustionReason::EmptyPool.to_string();
        let untested = ExhaustionReason::NoneEligible {
            total: 1,
            active: 1,
            untested: 1,
        }
        .to_string();
        assert_ne!(empty, untested);
        assert!(empty.contains("add keys"));
    }

    #[test]
    fn test_business_classification() {
        assert!(AppError::PoolExhausted(ExhaustionReason::EmptyPool).is_business());
        assert!(!AppError::Internal("boom".into()).is_business());
    }
}
