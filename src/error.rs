use thiserror::Error;

/// The taxonomy of failures the core can surface, per spec §7.
///
/// Propagation is strict: nothing in this crate swallows an error. A failed
/// user operation always leaves the index in a state that is either fully
/// applied (and fetchable) or fully un-applied — never half-written.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("invalid file header")]
    InvalidFileHeader,

    #[error("invalid file format version: expected {expected}, found {found}")]
    InvalidFileVersion { expected: u8, found: u8 },

    #[error("I/O error")]
    Io(#[source] std::io::Error),

    #[error("file not found")]
    FileNotFound,

    #[error("operation would block")]
    WouldBlock,

    #[error("resource limit reached: {0}")]
    LimitsReached(&'static str),

    #[error("network error")]
    NetworkError,

    #[error("out of memory")]
    OutOfMemory,

    #[error("key not found")]
    KeyNotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("cursor is still open")]
    CursorStillOpen,

    #[error("integrity violated: {0}")]
    IntegrityViolated(&'static str),

    #[error("blob not found: id {0:#x}")]
    BlobNotFound(u64),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Error::FileNotFound,
            ErrorKind::WouldBlock => Error::WouldBlock,
            _ => Error::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
