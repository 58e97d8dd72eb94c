//! Channel abstraction and link handshake for OR-to-OR connections.
//!
//! # Overview
//!
//! A *channel* is a point-to-point, authenticated carrier of cells
//! between two onion routers, or between a client and a router.  This
//! crate implements the transport-abstract channel layer that sits
//! between a relay's TLS connections and its circuit multiplexer:
//!
//! * [`channel::Channel`]: the channel itself — a precise state
//!   machine with inbound and outbound cell queues, handler slots for
//!   the circuit layer, and pluggable transport methods.
//! * [`channel::registry::ChannelRegistry`]: the process-wide indices
//!   of channels by state class.
//! * [`tls::TlsChannel`]: the concrete transport over an OR TLS
//!   connection, including the VERSIONS / CERTS / AUTH_CHALLENGE /
//!   AUTHENTICATE / NETINFO link handshake on both the initiator and
//!   responder sides.
//!
//! # Not in this crate
//!
//! No TLS, no sockets, no cryptographic primitives, and no circuit
//! logic live here: those are reached through the interfaces in
//! [`external`], so the layer can be driven from any event loop and
//! tested against stubs.
//!
//! The channel core is single-threaded and cooperative.  Callbacks
//! run synchronously on the caller's stack, and may safely reenter
//! the channel that called them.

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

pub mod channel;
pub mod external;
mod err;
#[cfg(feature = "threaded-relaycrypt")]
pub mod relaycrypt;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use err::Error;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
