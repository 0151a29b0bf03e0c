use std::path::PathBuf;
use thiserror::Error;

/// Failure cause carried by an [`Outcome`](crate::Outcome).
///
/// Outcomes are handed between worker tasks, completion callbacks and the
/// driver loop, so the cause is `Clone` and holds no borrowed or non-shareable
/// error values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer cancel signal received")]
    Cancelled,

    #[error("rsync transfer failed with exit code {exit_code}; see the rsync man page for an explanation")]
    Failed { exit_code: i32 },

    #[error("Unable to parse byte count from rsync line: {line:?}")]
    OutputParse { line: String },

    #[error("{program} executable not found; install it and make sure it is on your PATH")]
    ToolNotFound { program: String },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("Worker pool is shut down and no longer accepts jobs")]
    PoolClosed,

    #[error("Failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Worker task failed: {reason}")]
    Worker { reason: String },

    #[error("Catalog error: {reason}")]
    Catalog { reason: String },
}

impl TransferError {
    /// Whether re-running the scheduler may succeed for the same item.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Cancelled
                | TransferError::Failed { .. }
                | TransferError::Worker { .. }
                | TransferError::Catalog { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransferError::ToolNotFound { .. } | TransferError::ConfigInvalid { .. } => {
                ErrorSeverity::Critical
            }
            TransferError::Spawn { .. }
            | TransferError::Worker { .. }
            | TransferError::Catalog { .. } => ErrorSeverity::High,
            TransferError::Failed { .. } | TransferError::PoolClosed => ErrorSeverity::Medium,
            TransferError::Cancelled | TransferError::OutputParse { .. } => ErrorSeverity::Low,
        }
    }

    /// Convert to exit code for CLI applications
    pub fn exit_code(&self) -> i32 {
        self.severity().exit_code()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl ErrorSeverity {
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorSeverity::Critical => 2,
            ErrorSeverity::High | ErrorSeverity::Medium => 1,
            ErrorSeverity::Low => 0,
        }
    }
}

/// Errors raised through conventional `?` propagation: catalog access,
/// configuration handling and construction of the transfer machinery.
#[derive(Error, Debug)]
pub enum AsynchyError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("A configuration already exists at {path}; pass --overwrite to replace it")]
    ConfigExists { path: PathBuf },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl From<prometheus::Error> for AsynchyError {
    fn from(e: prometheus::Error) -> Self {
        AsynchyError::Metrics(e.to_string())
    }
}

impl From<AsynchyError> for TransferError {
    fn from(e: AsynchyError) -> Self {
        match e {
            AsynchyError::Transfer(inner) => inner,
            AsynchyError::Catalog(inner) => TransferError::Catalog {
                reason: inner.to_string(),
            },
            other => TransferError::Worker {
                reason: other.to_string(),
            },
        }
    }
}

impl AsynchyError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AsynchyError::Transfer(e) => e.exit_code(),
            AsynchyError::ConfigNotFound { .. }
            | AsynchyError::ConfigExists { .. }
            | AsynchyError::ConfigParse(_) => ErrorSeverity::Critical.exit_code(),
            _ => ErrorSeverity::High.exit_code(),
        }
    }
}

/// Result type alias for asynchy operations
pub type AsynchyResult<T> = Result<T, AsynchyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let error = TransferError::Failed { exit_code: 23 };
        assert_eq!(error.severity(), ErrorSeverity::Medium);
        assert_eq!(error.exit_code(), 1);

        let fatal = TransferError::ToolNotFound {
            program: "rsync".to_string(),
        };
        assert_eq!(fatal.exit_code(), 2);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransferError::Failed { exit_code: 12 }.is_retryable());
        assert!(TransferError::Cancelled.is_retryable());
        assert!(!TransferError::ConfigInvalid {
            field: "host".to_string(),
            reason: "empty".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_catalog_error_crosses_into_transfer_error() {
        let err: TransferError = AsynchyError::Catalog(rusqlite::Error::QueryReturnedNoRows).into();
        assert!(matches!(err, TransferError::Catalog { .. }));

        let err: TransferError = AsynchyError::Transfer(TransferError::PoolClosed).into();
        assert_eq!(err, TransferError::PoolClosed);
    }

    #[test]
    fn test_failed_message_mentions_exit_code() {
        let message = TransferError::Failed { exit_code: 23 }.to_string();
        assert!(message.contains("23"));
    }
}
