//! Coding and decoding for the cells that make up the OR link protocol.
//!
//! # Overview
//!
//! Cells are the unit of communication between two onion routers, or
//! between a client and a router, over an authenticated link.  Some
//! cells are fixed-length (their body is padded to a constant size);
//! a few commands use a variable-length format with an explicit
//! length field.
//!
//! This crate defines the raw cell records ([`chancell::Cell`] and
//! [`chancell::VarCell`]) that the channel layer queues and
//! dispatches, typed bodies for the link-handshake messages
//! ([`chancell::msg`]), and a byte-level codec
//! ([`chancell::codec::ChannelCodec`]) that a connection buffer can
//! use to frame cells on the wire.

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

pub mod chancell;
mod err;

pub use err::Error;

/// An error type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
