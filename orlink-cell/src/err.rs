//! Define an error type for the orlink-cell crate.

use thiserror::Error;

/// An error type for the orlink-cell crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// An error occurred in the orlink_bytes crate while decoding an
    /// object.
    #[error("parsing error: {0}")]
    BytesErr(#[from] orlink_bytes::Error),
    /// A cell body was too long to fit into its cell.
    #[error("cell body too long to encode")]
    CantEncode,
    /// A cell was not well-formed at the framing level.
    #[error("invalid cell: {0}")]
    ChanProto(String),
    /// There was a programming error somewhere in the code.
    #[error("internal programming error: {0}")]
    Internal(String),
}
