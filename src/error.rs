//! Error types for salmonrun
//!
//! Handler-level errors are converted to `AppError`, which implements
//! `IntoResponse`; background flows (verification round-trips, deliveries)
//! log and drop their errors instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::{codec, envelope, feed, pki, xrd};

/// Application-wide error type
///
/// Maps each failure onto the HTTP status the protocol prescribes: malformed
/// input, unsupported media types and failed envelope verification are the
/// caller's fault (400), unknown resources are 404, everything else is 500.
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("resource not found")]
    NotFound,

    /// Malformed request (400)
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown content type or envelope encoding (400)
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    /// Envelope parsing or verification failed (400)
    #[error("invalid envelope: {0}")]
    Envelope(#[from] envelope::Error),

    /// Key parsing failed (400)
    #[error("invalid key: {0}")]
    Key(#[from] codec::Error),

    /// Public key lookup failed (400)
    #[error("key lookup failed: {0}")]
    Pki(#[from] pki::Error),

    /// Feed or entry parsing failed (400)
    #[error("malformed feed: {0}")]
    Feed(#[from] feed::Error),

    /// Configuration error (500)
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<xrd::Error> for AppError {
    fn from(err: xrd::Error) -> Self {
        match err {
            xrd::Error::NoSuchResource => AppError::NotFound,
            other => AppError::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Client-side failures keep their message in the body; server-side
    /// failures are logged with detail and answered with a generic message.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type, should_log_detail) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string(), "not_found", false),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "validation", false)
            }
            AppError::UnsupportedMediaType(msg) => (
                StatusCode::BAD_REQUEST,
                format!("unsupported media type: {msg}"),
                "unsupported_media_type",
                false,
            ),
            AppError::Envelope(_) => {
                (StatusCode::BAD_REQUEST, self.to_string(), "envelope", false)
            }
            AppError::Key(_) => (StatusCode::BAD_REQUEST, self.to_string(), "key", false),
            AppError::Pki(_) => (StatusCode::BAD_REQUEST, self.to_string(), "pki", false),
            AppError::Feed(_) => (StatusCode::BAD_REQUEST, self.to_string(), "feed", false),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                "config",
                true,
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
                true,
            ),
        };

        if should_log_detail {
            tracing::error!(error = %self, %error_type, "Request failed with internal details");
        }

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn internal_errors_are_sanitized() {
        let response =
            AppError::Internal(anyhow::anyhow!("backend exploded at secret-host")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body_text = String::from_utf8(body.to_vec()).expect("utf8 body");
        assert!(body_text.contains("Internal server error"));
        assert!(!body_text.contains("secret-host"));
    }

    #[tokio::test]
    async fn validation_errors_keep_message() {
        let response = AppError::Validation("invalid hub.mode".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body_text = String::from_utf8(body.to_vec()).expect("utf8 body");
        assert!(body_text.contains("invalid hub.mode"));
    }

    #[tokio::test]
    async fn missing_resources_map_to_404() {
        let response = AppError::from(crate::xrd::Error::NoSuchResource).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
