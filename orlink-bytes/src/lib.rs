//! Utilities to decode/encode things into bytes.
//!
//! We use these to build and handle all the byte-encoded objects of
//! the OR link protocol: cells, handshake messages, and the address
//! records inside them.
//!
//! These tools are generally unsuitable for handling anything bigger
//! than a few kilobytes in size.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![warn(clippy::manual_ok_or)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::option_option)]
#![warn(clippy::unseparated_literal_suffix)]

mod err;
mod impls;
mod reader;
mod writer;

pub use err::Error;
pub use reader::Reader;
pub use writer::Writer;

/// Result type returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Trait for an object that can be encoded onto a Writer by reference.
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B);
}

/// Trait for an object that can be encoded onto a Writer in a way that
/// consumes the original object.
pub trait WriteableOnce {
    /// Encode this object into the writer `b`, consuming it.
    fn write_into<B: Writer + ?Sized>(self, b: &mut B);
}

// ----------------------------------------------------------------------

/// Trait for an object that can be extracted from a Reader.
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

// ----------------------------------------------------------------------
