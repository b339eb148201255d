//! Error handling module
//!
//! Defines the gateway's error taxonomy and its mapping onto HTTP
//! responses. Transport-level classification happens once, close to the
//! upstream call; everything above the adapter boundary only sees these
//! variants.

use crate::services::classifier::{ClassifiedError, ErrorClass};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed or expired bearer token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Request validation failed
    #[error("Request validation failed: {0}")]
    Validation(String),

    /// Free-tier quota exhausted
    #[error("{message}")]
    QuotaExceeded { message: String },

    /// Classified upstream failure surfaced after retries
    #[error("{0}")]
    Upstream(ClassifiedError),

    /// No usable API key for the request
    #[error("No API keys configured for this provider")]
    NoCredentials,

    /// A completed stream produced no user-visible text
    #[error("Stream completed without any visible output")]
    EmptyVisibleStream,

    /// Image generation polling exhausted its attempt budget
    #[error("Image generation timed out after {0} seconds")]
    ImageTimeout(u64),

    /// Server-side credential missing or unusable
    #[error("Service temporarily unavailable: {0}")]
    ServiceUnavailable(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Gateway error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(rename = "needsUpgrade", skip_serializing_if = "Option::is_none")]
    pub needs_upgrade: Option<bool>,
}

impl AppError {
    /// Get HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            AppError::Upstream(err) => match err.class {
                ErrorClass::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::BAD_GATEWAY,
            },
            AppError::NoCredentials | AppError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::EmptyVisibleStream | AppError::ImageTimeout(_) => StatusCode::BAD_GATEWAY,
            AppError::Config(_)
            | AppError::HttpClient(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error type string
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Authentication(_) => "authentication_error",
            AppError::Validation(_) => "invalid_request_error",
            AppError::QuotaExceeded { .. } => "quota_exceeded",
            AppError::Upstream(err) => match err.class {
                ErrorClass::RateLimited => "rate_limit_error",
                ErrorClass::KeyInvalid => "key_invalid_error",
                ErrorClass::Retryable => "upstream_unavailable",
                ErrorClass::Fatal => "upstream_error",
            },
            AppError::NoCredentials => "no_credentials",
            AppError::EmptyVisibleStream => "empty_stream_error",
            AppError::ImageTimeout(_) => "image_timeout",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Config(_)
            | AppError::HttpClient(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => "api_error",
        }
    }

    /// Whether detailed error information should be logged
    pub fn should_log_details(&self) -> bool {
        !matches!(
            self,
            AppError::Authentication(_) | AppError::QuotaExceeded { .. }
        )
    }

    /// Build the JSON body for this error
    pub fn to_body(&self) -> ErrorBody {
        let (remaining, needs_upgrade) = match self {
            AppError::QuotaExceeded { .. } => (Some(0), Some(true)),
            _ => (None, None),
        };
        ErrorBody {
            error: self.error_type().to_string(),
            message: self.to_string(),
            remaining,
            needs_upgrade,
        }
    }
}

/// Allow errors to be returned directly as HTTP responses
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.should_log_details() {
            tracing::error!("Request failed: {} - status {}", self, status);
        } else {
            tracing::warn!("Client error: {} - status {}", self.error_type(), status);
        }

        (status, Json(self.to_body())).into_response()
    }
}

impl From<ClassifiedError> for AppError {
    fn from(err: ClassifiedError) -> Self {
        AppError::Upstream(err)
    }
}

/// Result type alias
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError::Authentication("bad token".to_string()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::QuotaExceeded {
                message: "out of conversations".to_string()
            }
            .status_code(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            AppError::ServiceUnavailable("no system key".to_string()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::EmptyVisibleStream.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_rate_limited_upstream_maps_to_429() {
        let err = AppError::Upstream(ClassifiedError::new(Some(429), "slow down"));
        assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.error_type(), "rate_limit_error");
    }

    #[test]
    fn test_quota_body_shape() {
        let err = AppError::QuotaExceeded {
            message: "weekly limit reached".to_string(),
        };
        let body = err.to_body();
        assert_eq!(body.error, "quota_exceeded");
        assert_eq!(body.remaining, Some(0));
        assert_eq!(body.needs_upgrade, Some(true));
    }
}
