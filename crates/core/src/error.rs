// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Database error: {0}")]
    Database(String),

    /// Uniqueness violation on `jobs.uuid`; benign for admission
    #[error("Job already queued: {0}")]
    DuplicateJob(String),

    /// No usable database connection (fatal)
    #[error("Connection error: {0}")]
    Connection(String),

    /// No processor can receive work (fatal)
    #[error("No processors: {0}")]
    NoProcessors(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Cooperative cancellation, not a failure
    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Fatal errors stop the whole monitor rather than the current item
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Connection(_) | AppError::NoProcessors(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// Note: sqlx::Error conversion is handled in infra-sqlite crate

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::Connection("gone".into()).is_fatal());
        assert!(AppError::NoProcessors("none".into()).is_fatal());
        assert!(!AppError::Database("locked".into()).is_fatal());
        assert!(!AppError::DuplicateJob("abc".into()).is_fatal());
        assert!(!AppError::Cancelled.is_fatal());
        assert!(AppError::Cancelled.is_cancelled());
    }
}
