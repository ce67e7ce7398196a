//! Error types for SFTP operations
//!
//! Every dispatcher operation funnels its failures through [`Error`]; the
//! session layer turns them into exactly one STATUS response, so no error
//! ever tears down the session or the process.

use crate::protocol::StatusCode;
use thiserror::Error;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// SFTP error types
#[derive(Error, Debug)]
pub enum Error {
    /// Any OS-level failure: not found, permission denied, I/O error
    #[error("{0}")]
    Filesystem(#[from] std::io::Error),

    /// Resolved path lies outside the configured root
    #[error("Bad path {0}")]
    OutOfJail(String),

    /// Handle id not present in this session's table
    #[error("Unknown handle ID {0}")]
    UnknownHandle(String),

    /// Directory operation on a file handle or vice versa
    #[error("Bad handle type: {0}")]
    BadHandleType(String),

    /// Operation on a handle that has already been closed
    #[error("Handle is already closed: {0}")]
    AlreadyClosed(String),

    /// open-dir target is not a directory
    #[error("{0} is not a directory")]
    NotADirectory(String),

    /// open-file target is not a regular file
    #[error("{0} is not a regular file")]
    NotARegularFile(String),

    /// Operation this responder declines to perform
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    /// Credentials did not match, or the method is not accepted
    #[error("Authentication failed: {0}")]
    AuthenticationRejected(String),

    /// Session limits reached (handle table full)
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Malformed or out-of-sequence SFTP packet
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if error was caused by the client's request
    ///
    /// Client errors are routine and logged at debug; everything else is a
    /// server-side condition worth an error line.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::OutOfJail(_)
                | Self::UnknownHandle(_)
                | Self::BadHandleType(_)
                | Self::AlreadyClosed(_)
                | Self::NotADirectory(_)
                | Self::NotARegularFile(_)
                | Self::UnsupportedOperation(_)
                | Self::Protocol(_)
        )
    }

    /// Check if error has security implications and should be audited
    pub fn is_security_event(&self) -> bool {
        match self {
            Self::OutOfJail(_) | Self::AuthenticationRejected(_) => true,
            Self::Filesystem(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }

    /// Get the SFTP STATUS code for this error
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::Filesystem(e) if e.kind() == std::io::ErrorKind::NotFound => {
                StatusCode::NoSuchFile
            }
            Self::UnsupportedOperation(_) => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }

    /// Get the message text carried by the STATUS response
    pub fn sanitized_message(&self) -> String {
        match self {
            // Don't reveal why authentication failed
            Self::AuthenticationRejected(_) => "Authentication failed".to_string(),
            Self::Config(_) => "Server configuration error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Self::Ssh(err.to_string())
    }
}

// Additional error constructors
impl Error {
    /// Create unknown handle error from raw handle bytes
    pub fn unknown_handle(handle: &[u8]) -> Self {
        Self::UnknownHandle(String::from_utf8_lossy(handle).into_owned())
    }

    /// Create unsupported operation error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::UnsupportedOperation(operation.into())
    }

    /// Create resource exhaustion error
    pub fn resource_exhaustion(context: impl Into<String>) -> Self {
        Self::ResourceExhaustion(context.into())
    }
}
