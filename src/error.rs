use thiserror::Error;

/// Main error type for the terminal farm
#[derive(Error, Debug)]
pub enum FarmError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Inbound payload errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // Lifecycle preconditions
    #[error("Auto-sync is already enabled for account {0}")]
    AlreadyEnabled(String),

    #[error("Auto-sync is not enabled for account {0}")]
    NotEnabled(String),

    // Quota
    #[error("Monthly sync limit reached ({current}/{max})")]
    QuotaExceeded { current: i32, max: i32 },

    // Write-path errors
    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Permanent write error: {0}")]
    PermanentWrite(String),

    // Broker bridge errors
    #[error("Deploy timeout: {0}")]
    DeployTimeout(String),

    #[error("Broker bridge error: {0}")]
    Bridge(String),

    // Credential errors
    #[error("Credential error: {0}")]
    Crypto(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for FarmError
pub type Result<T> = std::result::Result<T, FarmError>;

impl FarmError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        FarmError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Network and timeout class failures that are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FarmError::Transient(_) => true,
            FarmError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed
            ),
            FarmError::Http(err) => err.is_timeout() || err.is_connect(),
            FarmError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
            ),
            _ => false,
        }
    }

    /// Expected traffic outcomes: logged at debug, never as warnings.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            FarmError::Validation(_) | FarmError::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(FarmError::Transient("reset".into()).is_transient());
        assert!(FarmError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!FarmError::PermanentWrite("duplicate key".into()).is_transient());
        assert!(!FarmError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn quota_message_carries_counts() {
        let err = FarmError::QuotaExceeded { current: 60, max: 60 };
        assert_eq!(err.to_string(), "Monthly sync limit reached (60/60)");
    }
}
