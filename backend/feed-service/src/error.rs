/// Error types for feed-service
///
/// Each layer has its own error type. Only [`AppError`] reaches clients; the
/// cache and publisher errors are absorbed by the feed engine.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use thiserror::Error;

/// Result type for feed-service operations
pub type Result<T> = std::result::Result<T, AppError>;

/// Durable store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Cache failure; always degraded to a miss by callers
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache disabled")]
    Disabled,
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failure talking to an upstream collaborator
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    #[error("credential rejected by {service}")]
    InvalidCredential { service: &'static str },
    #[error("unexpected response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
}

impl UpstreamError {
    pub fn unavailable(service: &'static str, message: impl ToString) -> Self {
        UpstreamError::Unavailable {
            service,
            message: message.to_string(),
        }
    }

    pub fn decode(service: &'static str, message: impl ToString) -> Self {
        UpstreamError::Decode {
            service,
            message: message.to_string(),
        }
    }
}

/// Failure publishing a feed event; never surfaced to clients
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kafka delivery failed: {0}")]
    Kafka(String),
}

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<UpstreamError> for AppError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::InvalidCredential { .. } => AppError::InvalidCredential(err.to_string()),
            UpstreamError::Unavailable { .. } | UpstreamError::Decode { .. } => {
                AppError::UpstreamUnavailable(err.to_string())
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Storage(StoreError::Database(err))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) | AppError::InvalidCredential(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Storage(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let (error_type, code) = match self {
            AppError::Validation(_) => ("validation_error", "VALIDATION_ERROR"),
            AppError::Unauthorized(_) => ("authentication_error", "UNAUTHORIZED"),
            AppError::InvalidCredential(_) => ("authentication_error", "INVALID_CREDENTIALS"),
            AppError::NotFound(_) => ("not_found_error", "NOT_FOUND"),
            AppError::UpstreamUnavailable(_) => ("dependency_error", "UPSTREAM_UNAVAILABLE"),
            AppError::Storage(_) => ("server_error", "DATABASE_ERROR"),
            AppError::Internal(_) => ("server_error", "INTERNAL_SERVER_ERROR"),
        };

        // Storage details stay in the logs.
        let message = match self {
            AppError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure");
                "Storage failure".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(status).json(ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            message,
            status: status.as_u16(),
            error_type: error_type.to_string(),
            code: code.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_map_to_client_statuses() {
        let unavailable: AppError = UpstreamError::unavailable("graph-service", "timeout").into();
        assert_eq!(unavailable.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let rejected: AppError = UpstreamError::InvalidCredential {
            service: "auth-service",
        }
        .into();
        assert_eq!(rejected.status_code(), StatusCode::UNAUTHORIZED);

        let garbled: AppError = UpstreamError::decode("post-service", "bad json").into();
        assert_eq!(garbled.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn storage_errors_are_server_errors() {
        let err: AppError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::Validation("page".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
