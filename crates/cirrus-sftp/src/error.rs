//! Error types for gateway operations
//!
//! Every error carries enough context for the operator log; what the client
//! sees is limited to an SFTP status code and [`Error::sanitized_message`].

use cirrus_store::StoreError;
use russh_sftp::protocol::StatusCode;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum Error {
    /// Local I/O error (scratch files, key files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Malformed or unsupported channel / subsystem request
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    ///
    /// The payload is for the operator log only, never for the client.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Path or object does not exist
    #[error("No such file: {0}")]
    NotFound(String),

    /// Background download made no progress within the transfer timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Object storage failure (network, storage auth, quota)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Operation with no object storage equivalent
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Path could not be mapped to an object key
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Unknown or already closed handle
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Catch-all for uncategorized errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Check if error was caused by client input
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPath(_)
                | Error::NotFound(_)
                | Error::InvalidHandle(_)
                | Error::NotSupported(_)
                | Error::Protocol(_)
        )
    }

    /// Check if error should be logged as a security event
    pub fn is_security_event(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::InvalidPath(_))
    }

    /// Map to the SFTP status code reported to the client
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NoSuchFile,
            Error::NotSupported(_) => StatusCode::OpUnsupported,
            Error::InvalidPath(_) | Error::InvalidHandle(_) => StatusCode::BadMessage,
            Error::Connection(_) => StatusCode::ConnectionLost,
            _ => StatusCode::Failure,
        }
    }

    /// Error message safe to send to a client
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Authentication failed".to_string(),
            Error::InvalidPath(_) => "Invalid path".to_string(),
            Error::Config(_) => "Server configuration error".to_string(),
            Error::Backend(_) => "Storage backend error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Create timeout error with context
    pub fn timeout(context: impl Into<String>) -> Self {
        Error::Timeout(context.into())
    }

    /// Create invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    /// Create unsupported operation error
    pub fn not_supported(operation: impl Into<String>) -> Self {
        Error::NotSupported(operation.into())
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            Error::NotFound(err.to_string())
        } else {
            Error::Backend(err.to_string())
        }
    }
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> Self {
        err.to_status_code()
    }
}
