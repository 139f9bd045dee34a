use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Database(anyhow::Error),
    DatabaseError(String),
    NotFound(String),
    Validation(String),
    IndexConflict(String),
    ConfigurationError(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "Database error: {}", err),
            AppError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation error: {}", msg),
            AppError::IndexConflict(msg) => write!(f, "Index conflict: {}", msg),
            AppError::ConfigurationError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// True when the error is an anonymous-index allocation race the caller
    /// can resolve by retrying the whole assignment.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, AppError::IndexConflict(_))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
