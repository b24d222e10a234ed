use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Lock lost: {0}")]
    LockLost(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether a job failing with this error should go back through backoff.
    ///
    /// Configuration problems and malformed input never get better on their
    /// own, so they fail the job immediately. A lost lock is handled by the
    /// store's expiry sweep rather than by an explicit retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::DatabaseError(_)
            | AppError::ExternalServiceError(_)
            | AppError::RateLimitExceeded(_)
            | AppError::NotFound(_)
            | AppError::ValidationError(_)
            | AppError::InternalError(_) => true,
            AppError::ConfigurationError(_)
            | AppError::InvalidInput(_)
            | AppError::SerializationError(_)
            | AppError::LockLost(_) => false,
        }
    }

    /// Short machine-friendly name, used in job failure reasons
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::DatabaseError(_) => "database",
            AppError::ExternalServiceError(_) => "external_service",
            AppError::RateLimitExceeded(_) => "rate_limit_exceeded",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::ValidationError(_) => "validation",
            AppError::ConfigurationError(_) => "configuration",
            AppError::LockLost(_) => "lock_lost",
            AppError::SerializationError(_) => "serialization",
            AppError::InternalError(_) => "internal",
        }
    }
}

#[cfg(feature = "postgres")]
impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => {
                AppError::NotFound("Record not found in database".to_string())
            }
            _ => AppError::DatabaseError(err.to_string()),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<diesel::r2d2::PoolError> for AppError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        AppError::DatabaseError(format!("Database pool error: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::ExternalServiceError("Request timeout".to_string())
        } else if err.is_connect() {
            AppError::ExternalServiceError("Failed to connect to external service".to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 => AppError::RateLimitExceeded("Too many requests".to_string()),
                404 => AppError::NotFound("External resource not found".to_string()),
                401 | 403 => AppError::ConfigurationError(
                    "Not authorized to access external service".to_string(),
                ),
                _ => AppError::ExternalServiceError(format!("HTTP {}: {}", status, err)),
            }
        } else {
            AppError::ExternalServiceError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("Invalid UUID: {}", err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(format!("I/O error: {}", err))
    }
}

impl From<std::num::ParseIntError> for AppError {
    fn from(err: std::num::ParseIntError) -> Self {
        AppError::InvalidInput(format!("Invalid number: {}", err))
    }
}

impl From<std::num::ParseFloatError> for AppError {
    fn from(err: std::num::ParseFloatError) -> Self {
        AppError::InvalidInput(format!("Invalid decimal number: {}", err))
    }
}

// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
