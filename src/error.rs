//! Error types for quire.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants follow
//! the failure classes the writer distinguishes: validation and resource errors
//! reject a single call, I/O and corruption errors may latch a tragic event on
//! the writer, and merge aborts are reported to the scheduler only.

use std::io;

/// The error type for all quire operations.
#[derive(Debug, thiserror::Error)]
pub enum QuireError {
    /// I/O error from the underlying storage.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error for settings and commit data.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised while building or reading a term dictionary.
    #[error("Term dictionary error: {0}")]
    Fst(#[from] fst::Error),

    /// A caller supplied an invalid argument or an inconsistent field schema.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// An index file failed validation (bad header, checksum or content).
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// No commit could be found in the storage.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// A file that must exist is missing.
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The storage write lock is held by someone else.
    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    /// The writer or reader is closed.
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    /// Adding documents would exceed the per-index document limit.
    #[error("Too many documents: {0}")]
    MaxDocsExceeded(String),

    /// A merge was aborted because of rollback, delete-all or close.
    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    /// Text analysis failed.
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Internal invariant violated.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for quire operations.
pub type Result<T> = std::result::Result<T, QuireError>;

impl QuireError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        QuireError::InvalidArgument(msg.into())
    }

    pub fn illegal_state<S: Into<String>>(msg: S) -> Self {
        QuireError::IllegalState(msg.into())
    }

    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        QuireError::CorruptIndex(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        QuireError::FileNotFound(msg.into())
    }

    pub fn already_closed<S: Into<String>>(msg: S) -> Self {
        QuireError::AlreadyClosed(msg.into())
    }

    pub fn analysis<S: Into<String>>(msg: S) -> Self {
        QuireError::Analysis(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        QuireError::Internal(msg.into())
    }

    pub fn merge_aborted<S: Into<String>>(msg: S) -> Self {
        QuireError::MergeAborted(msg.into())
    }

    pub fn max_docs_exceeded<S: Into<String>>(msg: S) -> Self {
        QuireError::MaxDocsExceeded(msg.into())
    }

    /// A copy of this error, used to report a latched failure more than once.
    ///
    /// Wrapped JSON and term dictionary errors keep only their message.
    pub fn duplicate(&self) -> Self {
        match self {
            QuireError::Io(e) => QuireError::Io(io::Error::new(e.kind(), e.to_string())),
            QuireError::Json(e) => QuireError::Internal(format!("JSON error: {e}")),
            QuireError::Fst(e) => QuireError::CorruptIndex(format!("term dictionary: {e}")),
            QuireError::InvalidArgument(m) => QuireError::InvalidArgument(m.clone()),
            QuireError::IllegalState(m) => QuireError::IllegalState(m.clone()),
            QuireError::CorruptIndex(m) => QuireError::CorruptIndex(m.clone()),
            QuireError::IndexNotFound(m) => QuireError::IndexNotFound(m.clone()),
            QuireError::FileNotFound(m) => QuireError::FileNotFound(m.clone()),
            QuireError::LockObtainFailed(m) => QuireError::LockObtainFailed(m.clone()),
            QuireError::AlreadyClosed(m) => QuireError::AlreadyClosed(m.clone()),
            QuireError::MaxDocsExceeded(m) => QuireError::MaxDocsExceeded(m.clone()),
            QuireError::MergeAborted(m) => QuireError::MergeAborted(m.clone()),
            QuireError::Analysis(m) => QuireError::Analysis(m.clone()),
            QuireError::Internal(m) => QuireError::Internal(m.clone()),
        }
    }

    /// Returns true for failures that leave a writer in an unknown state.
    ///
    /// Validation and resource errors only reject the offending call. I/O
    /// errors, corruption and broken internal invariants are escalated to a
    /// tragic event when they hit the writer outside of a single document.
    pub fn is_tragic_candidate(&self) -> bool {
        matches!(
            self,
            QuireError::Io(_) | QuireError::CorruptIndex(_) | QuireError::Internal(_)
        )
    }

    /// Returns true if this error only rejected one document.
    pub fn is_document_local(&self) -> bool {
        matches!(
            self,
            QuireError::InvalidArgument(_)
                | QuireError::Analysis(_)
                | QuireError::MaxDocsExceeded(_)
        )
    }
}
