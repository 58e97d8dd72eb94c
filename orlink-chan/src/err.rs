//! Define an error type for the orlink-chan crate.

use thiserror::Error;

/// An error type for the orlink-chan crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An error that occurred while encoding or decoding a cell.
    #[error("cell error: {0}")]
    CellErr(#[from] orlink_cell::Error),
    /// Protocol violation at the channel level.
    #[error("channel protocol violation: {0}")]
    ChanProto(String),
    /// The lower layer could not deliver a cell we tried to send.
    #[error("could not send {0} cell")]
    SendFailed(&'static str),
    /// There was a programming error somewhere in the code.
    #[error("Internal programming error: {0}")]
    Internal(String),
}
