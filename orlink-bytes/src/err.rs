//! Error type for the orlink-bytes crate.

use thiserror::Error;

/// Error type for decoding OR link objects from bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The object was truncated, or not fully present.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// There were extra bytes after the object.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// The object was malformed in some way.
    #[error("bad object: {0}")]
    BadMessage(&'static str),
    /// Something went wrong that should never happen.
    #[error("internal programming error")]
    Internal,
}
