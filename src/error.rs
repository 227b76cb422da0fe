//! Engine error taxonomy.

use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Retry-on-contention is not an error: non-blocking pins report it
/// through [`crate::cache::PinOutcome::NeedRetry`] and it is always
/// resolved inside the crate by unwinding the descent.
#[derive(Error, Debug)]
pub enum Error {
    /// `InsertNoOverwrite` hit a live committed value.
    #[error("key already exists")]
    KeyExists,
    /// A snapshot read was issued against a dictionary created after the
    /// snapshot was taken.
    #[error("dictionary too new for snapshot")]
    DictionaryTooNewForSnapshot,
    /// Keys must be non-empty; the empty key is reserved for broadcasts.
    #[error("empty key")]
    EmptyKey,
    /// An invalid cursor range was requested.
    #[error("invalid range")]
    InvalidRange,
    /// The dictionary is poisoned by an earlier non-recoverable error.
    /// Every subsequent operation returns this until the tree is closed.
    #[error("dictionary panicked: {reason} (code {code})")]
    Panicked { code: i32, reason: String },
    /// The block allocator ran out of space.
    #[error("disk full")]
    DiskFull,
    /// The cache could not stay inside its memory budget.
    #[error("out of memory")]
    NoMemory,
    /// Propagated from the cache or the block layer.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    /// On-disk data failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

impl From<crate::checksum::ChecksumError> for Error {
    fn from(_: crate::checksum::ChecksumError) -> Self {
        Error::ChecksumMismatch
    }
}

impl Error {
    /// Panic code recorded in the header for this error, if it taints
    /// the dictionary.
    pub(crate) fn panic_code(&self) -> Option<i32> {
        match self {
            Error::Io(_) => Some(5),
            Error::ChecksumMismatch => Some(74),
            Error::DiskFull => Some(28),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
