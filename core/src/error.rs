use thiserror::Error;

use crate::repository::RepoState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Repository not found at {path}")]
    RepositoryNotFound { path: String },

    #[error("Repository already exists at {path}")]
    RepositoryExists { path: String },

    #[error("Invalid repository format version: {version}")]
    InvalidFormatVersion { version: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Integrity check failed for {object}: {reason}")]
    Integrity { object: String, reason: String },

    #[error("Repository inconsistent: {0}")]
    Inconsistent(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Operation not valid while repository is {state}")]
    InvalidState { state: RepoState },

    #[error("Transient backend error: {0}")]
    TransientIo(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Pack upload failed: {0}")]
    UploadFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound { what: what.into() }
    }

    pub fn integrity(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Integrity {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// Attaches the identity of the object an integrity failure was found in.
    pub fn for_object(self, object: impl std::fmt::Display) -> Self {
        match self {
            Error::Integrity { reason, .. } => Error::Integrity {
                object: object.to_string(),
                reason,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } | Error::RepositoryNotFound { .. } => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Errors a backend call may succeed on when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientIo(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
