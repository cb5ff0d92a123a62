//! Defines the crate-wide error taxonomy returned by state cache operations.

use thiserror::Error;

/// Result of state cache operations with error type [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failures produced by the file-state cache and its coordinators.
///
/// The surrounding dispatcher maps each kind to a stable SMB status code.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested access is incompatible with the sharing mode granted
    /// to the existing opens of the file.
    #[error("sharing mode conflict")]
    SharingViolation,

    /// Disposition-level refusal, or the terminal outcome delivered to a
    /// deferred request when an oplock break times out.
    #[error("access denied")]
    AccessDenied,

    /// The create disposition required the file not to exist, but it does.
    #[error("file already exists")]
    FileExists,

    /// The create disposition required the file to exist, but it does not.
    #[error("file not found")]
    FileNotFound,

    /// A byte-range lock overlaps a range held by a different owner.
    #[error("byte-range lock conflict")]
    LockConflict,

    /// No byte-range lock with the given owner and range exists.
    #[error("byte range is not locked")]
    NotLocked,

    /// The deferred-request queue was full at the moment of append.
    #[error("deferred request queue is full")]
    DeferFailed,

    /// An oplock is already attached to the file state.
    #[error("file already has an oplock")]
    ExistingOpLock,

    /// The partition owner rejected a remote task, or the task timed out.
    #[error("remote task failed: {0}")]
    RemoteTaskFailure(String),

    /// A path failed normalization (empty, or contains a NUL byte).
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A configuration document failed to parse or validate.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A request could not be delivered or resumed.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Tells whether the error kind is retryable by the client after the
    /// triggering condition clears.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::SharingViolation | Error::LockConflict | Error::DeferFailed)
    }
}
