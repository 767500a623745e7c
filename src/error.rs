use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Infrastructure and usage errors raised by the guard components.
///
/// Policy outcomes (rate limited, bad token, rejected input) are not errors;
/// they are reported through [`GuardRejection`] or plain booleans.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Storage operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Request has no session; CSRF tokens require one")]
    MissingSession,
}

impl GuardError {
    pub fn storage(message: impl Into<String>) -> Self {
        GuardError::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        GuardError::Config {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(err: sqlx::Error) -> Self {
        GuardError::Storage {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for GuardError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        GuardError::Storage {
            message: format!("migration failed: {}", err),
            source: Some(Box::new(err)),
        }
    }
}

pub type GuardResult<T> = Result<T, GuardError>;

/// Error classification exposed to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    TooManyRequests,
    InvalidCsrfToken,
    Forbidden,
    InvalidInput,
}

/// Why a guarded request was turned away.
///
/// Messages are deliberately generic: they never tell the client which
/// internal check failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardRejection {
    RateLimited { retry_after_secs: i64 },
    InvalidCsrfToken,
    Blacklisted,
    InvalidInput { field: String },
}

impl GuardRejection {
    pub fn code(&self) -> RejectionCode {
        match self {
            GuardRejection::RateLimited { .. } => RejectionCode::TooManyRequests,
            GuardRejection::InvalidCsrfToken => RejectionCode::InvalidCsrfToken,
            GuardRejection::Blacklisted => RejectionCode::Forbidden,
            GuardRejection::InvalidInput { .. } => RejectionCode::InvalidInput,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GuardRejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GuardRejection::InvalidCsrfToken => StatusCode::FORBIDDEN,
            GuardRejection::Blacklisted => StatusCode::FORBIDDEN,
            GuardRejection::InvalidInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            GuardRejection::RateLimited { retry_after_secs } => too_many_attempts_message(*retry_after_secs),
            GuardRejection::InvalidCsrfToken => "Invalid security token, please retry".to_string(),
            GuardRejection::Blacklisted => "Access denied".to_string(),
            GuardRejection::InvalidInput { field } => format!("Invalid value for field '{}'", field),
        }
    }
}

/// Generic lockout message, rounded up to whole minutes
pub fn too_many_attempts_message(retry_after_secs: i64) -> String {
    let minutes = ((retry_after_secs.max(1) + 59) / 60).max(1);
    if minutes == 1 {
        "Too many attempts, try again in 1 minute".to_string()
    } else {
        format!("Too many attempts, try again in {} minutes", minutes)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RejectionBody {
    pub code: RejectionCode,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for GuardRejection {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = RejectionBody {
            code: self.code(),
            message: self.user_message(),
            status: status.as_u16(),
        };

        let mut response = (status, Json(body)).into_response();
        if let GuardRejection::RateLimited { retry_after_secs } = self
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.max(1).to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            GuardRejection::RateLimited { retry_after_secs: 10 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(GuardRejection::InvalidCsrfToken.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(GuardRejection::Blacklisted.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            GuardRejection::InvalidInput { field: "email".to_string() }.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_lockout_message_rounds_up_to_minutes() {
        assert_eq!(too_many_attempts_message(1), "Too many attempts, try again in 1 minute");
        assert_eq!(too_many_attempts_message(60), "Too many attempts, try again in 1 minute");
        assert_eq!(too_many_attempts_message(61), "Too many attempts, try again in 2 minutes");
        assert_eq!(too_many_attempts_message(900), "Too many attempts, try again in 15 minutes");
    }

    #[test]
    fn test_rate_limited_response_has_retry_after() {
        let response = GuardRejection::RateLimited { retry_after_secs: 120 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("120")
        );
    }

    #[test]
    fn test_storage_error_from_sqlx() {
        let err: GuardError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, GuardError::Storage { .. }));
        assert!(err.to_string().starts_with("Storage error"));
    }
}
