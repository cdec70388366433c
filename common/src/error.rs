use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Lock taken: {0}")]
    LockTaken(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means the target does not exist (or the caller
    /// is not allowed to know that it does).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
