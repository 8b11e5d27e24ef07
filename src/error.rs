//! Unified error hierarchy for loadrs
//!
//! Only three failure classes surface as errors: invalid configuration,
//! collaborator failures, and store/migration problems. Insufficient history
//! and degenerate ratios are handled as data (null values and low-confidence
//! flags) and never reach this module.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;

/// Top-level error type for all loadrs operations
#[derive(Debug, Error)]
pub enum LoadRsError {
    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// ACWR parameters rejected at the configuration boundary
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(#[from] ConfigurationError),

    /// Text-generation collaborator failures
    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Batch re-aggregation errors
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// Start date after end date
    #[error("Invalid date range: {start} is after {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    /// Input data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Database operation errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Record not found
    #[error("Record not found: {table}.{id}")]
    NotFound { table: String, id: String },

    /// Integrity check failed
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Connection mutex was poisoned by a panicking writer
    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::Serialization(err.to_string())
    }
}

/// Out-of-range ACWR parameters
#[derive(Debug, Error, PartialEq)]
pub enum ConfigurationError {
    /// Chronic window outside the supported range
    #[error("chronic window of {value} days is outside [{min}, {max}]")]
    ChronicWindowOutOfRange { value: u16, min: u16, max: u16 },

    /// Decay rate outside the supported range
    #[error("decay rate {value} is outside [{min}, {max}]")]
    DecayRateOutOfRange {
        value: Decimal,
        min: Decimal,
        max: Decimal,
    },

    /// Configuration name is empty
    #[error("configuration name must not be empty")]
    EmptyName,

    /// Referenced configuration does not exist
    #[error("unknown configuration id {0}")]
    UnknownConfiguration(i64),
}

/// Text-generation collaborator errors
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator did not answer in time
    #[error("generation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The collaborator answered with nothing usable
    #[error("generation returned an empty reply")]
    EmptyReply,

    /// The collaborator could not be reached or exited abnormally
    #[error("generator unavailable: {0}")]
    Unavailable(String),
}

/// Batch re-aggregation errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// No users matched the migration target
    #[error("no users matched the migration target")]
    NoTargets,

    /// Batch size of zero was requested
    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    /// A single batch failed
    #[error("batch {index} failed: {reason}")]
    BatchFailed { index: usize, reason: String },
}

/// Result type alias for loadrs operations
pub type Result<T> = std::result::Result<T, LoadRsError>;

impl LoadRsError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoadRsError::Collaborator(CollaboratorError::Timeout { .. })
                | LoadRsError::Collaborator(CollaboratorError::EmptyReply)
                | LoadRsError::Database(DatabaseError::Sqlite(
                    rusqlite::Error::SqliteFailure(_, _)
                ))
                | LoadRsError::Io(_)
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            LoadRsError::ConfigurationInvalid(_) => ErrorSeverity::Warning,
            LoadRsError::InvalidDateRange { .. } => ErrorSeverity::Warning,
            LoadRsError::Validation(_) => ErrorSeverity::Warning,
            LoadRsError::Collaborator(_) => ErrorSeverity::Warning,
            LoadRsError::Database(DatabaseError::NotFound { .. }) => ErrorSeverity::Warning,
            LoadRsError::Database(DatabaseError::LockPoisoned) => ErrorSeverity::Critical,
            LoadRsError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            LoadRsError::ConfigurationInvalid(ConfigurationError::ChronicWindowOutOfRange {
                value,
                min,
                max,
            }) => format!(
                "A chronic window of {} days is not supported. Choose between {} and {} days.",
                value, min, max
            ),
            LoadRsError::ConfigurationInvalid(ConfigurationError::DecayRateOutOfRange {
                value,
                min,
                max,
            }) => format!(
                "A decay rate of {} is not supported. Choose between {} and {}.",
                value, min, max
            ),
            LoadRsError::Collaborator(_) => {
                "Guidance could not be generated right now; a metrics-based plan was used instead."
                    .to_string()
            }
            LoadRsError::Database(DatabaseError::Sqlite(_)) => {
                "Unable to access the training database. Please check your configuration."
                    .to_string()
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_severity() {
        let err = LoadRsError::ConfigurationInvalid(ConfigurationError::ChronicWindowOutOfRange {
            value: 27,
            min: 28,
            max: 90,
        });
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err = LoadRsError::Internal("test".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_error_retryable() {
        let err = LoadRsError::Collaborator(CollaboratorError::Timeout { seconds: 30 });
        assert!(err.is_retryable());

        let err = LoadRsError::Validation("test".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_user_messages() {
        let err = LoadRsError::ConfigurationInvalid(ConfigurationError::DecayRateOutOfRange {
            value: dec!(0.25),
            min: dec!(0),
            max: dec!(0.20),
        });
        assert!(err.user_message().contains("0.25"));

        let err = LoadRsError::Collaborator(CollaboratorError::EmptyReply);
        assert!(err.user_message().contains("metrics-based"));
    }
}
