/// Sprocket Error Module
///
/// This module defines the error taxonomy shared by the coercion layer, the
/// command dispatcher, the execution runtime and the large-object store.
/// Provider errors from rusqlite are classified into one of these kinds and
/// never reach callers as-is.
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error type for every fallible sprocket operation.
///
/// "Not found" is deliberately absent: lookups report it through
/// [`crate::storage::Lookup::NotFound`] so it cannot be confused with a
/// store failure.
#[derive(Error, Debug)]
pub enum SprocketError {
    /// A value could not be rendered as a database parameter
    #[error("Serialization error: cannot serialize {type_name}: {message}")]
    Serialization {
        type_name: &'static str,
        message: String,
    },

    /// A raw database value did not match the declared target type
    #[error("Deserialization error: cannot read {type_name} from {raw:?}: {message}")]
    Deserialization {
        raw: String,
        type_name: &'static str,
        message: String,
    },

    /// The database rejected the command
    #[error("Execution error: {message}. Command={command}")]
    Execution { command: String, message: String },

    /// The command ran past its timeout and was interrupted
    #[error("Timeout error: command exceeded {timeout:?}. Command={command}")]
    Timeout { command: String, timeout: Duration },

    /// The caller cancelled an asynchronous call while it was in flight
    #[error("Cancelled. Command={command}")]
    Cancelled { command: String },

    /// A chunked object has missing or inconsistent chunks
    #[error("Corrupted object {id}: {message}")]
    CorruptedObject { id: Uuid, message: String },

    /// No pooled connection could be opened or acquired
    #[error("Pool error: {0}")]
    Pool(String),

    /// Configuration loading and validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SprocketError {
    /// Wraps a provider failure for the given command identifier.
    pub fn execution(command: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SprocketError::Execution {
            command: command.into(),
            message: err.to_string(),
        }
    }

    pub fn corrupted(id: Uuid, message: impl Into<String>) -> Self {
        SprocketError::CorruptedObject {
            id,
            message: message.into(),
        }
    }

    /// The command identifier carried by execution-side errors.
    pub fn command(&self) -> Option<&str> {
        match self {
            SprocketError::Execution { command, .. }
            | SprocketError::Timeout { command, .. }
            | SprocketError::Cancelled { command } => Some(command),
            _ => None,
        }
    }

    /// Whether an idempotent read may be retried after this error.
    ///
    /// Only timeouts qualify. The core never retries on its own since it
    /// cannot tell reads from writes.
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, SprocketError::Timeout { .. })
    }
}

/// Type alias for Result to use SprocketError as the error type.
pub type Result<T> = std::result::Result<T, SprocketError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let exec_err = SprocketError::execution("people_get", "no such table: people");
        assert_eq!(
            exec_err.to_string(),
            "Execution error: no such table: people. Command=people_get"
        );

        let timeout = SprocketError::Timeout {
            command: "slow".to_string(),
            timeout: Duration::from_millis(50),
        };
        assert!(timeout.to_string().contains("Timeout error"));

        let config_err = SprocketError::Config("Invalid config".to_string());
        assert!(config_err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_command_identifier() {
        let err = SprocketError::Cancelled {
            command: "people_list".to_string(),
        };
        assert_eq!(err.command(), Some("people_list"));
        assert_eq!(SprocketError::Pool("exhausted".to_string()).command(), None);
    }

    #[test]
    fn test_only_timeouts_are_retryable() {
        let timeout = SprocketError::Timeout {
            command: "q".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable_read());
        assert!(!SprocketError::execution("q", "constraint failed").is_retryable_read());
        assert!(!SprocketError::corrupted(Uuid::nil(), "gap").is_retryable_read());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SprocketError = io_err.into();
        match err {
            SprocketError::Io(_) => {}
            _ => panic!("Expected IO error"),
        }
    }
}
