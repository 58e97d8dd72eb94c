//! Interfaces onto the subsystems that the channel layer collaborates
//! with.
//!
//! The channel core implements no cryptography, keeps no clock, and
//! owns no sockets; everything of that kind is reached through the
//! traits here.  A real process wires these up to its TLS stack,
//! certificate code, and circuit machinery; tests substitute stubs.

use crate::channel::{Channel, CircIdRange};
use crate::Result;
use orlink_cell::chancell::msg::{CertKind, DestroyReason};
use orlink_cell::chancell::{Cell, VarCell};
use rand::{Rng, RngCore};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

/// A source of wall-clock time, in seconds since the epoch.
pub trait Clock {
    /// Return the current time.
    fn now(&self) -> u64;
    /// Return a cached, approximate current time.
    ///
    /// The default implementation just asks for the real time.
    fn approx_now(&self) -> u64 {
        self.now()
    }
}

/// A source of cryptographic-quality randomness.
pub trait EntropySource {
    /// Fill `out` with random bytes.
    fn fill_bytes(&self, out: &mut [u8]);
    /// Return a uniform random value in `[0, bound)`.
    fn pick_u16(&self, bound: u16) -> u16;
}

/// An [`EntropySource`] backed by the operating system's RNG.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill_bytes(&self, out: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(out);
    }
    fn pick_u16(&self, bound: u16) -> u16 {
        rand::rngs::OsRng.gen_range(0..bound)
    }
}

/// A running SHA-256 digest over handshake data.
///
/// `finalize` must not disturb the running state: it reports the
/// digest of everything appended so far, and more data may be
/// appended afterwards.
pub trait DigestStream {
    /// Add more bytes to the digest.
    fn append(&mut self, data: &[u8]);
    /// Report the SHA-256 digest of everything appended so far.
    fn finalize(&self) -> [u8; 32];
}

/// A decoded certificate received in a CERTS cell.
///
/// Decoding, signature checking, and key extraction are all the
/// business of the [`CertDecoder`] that produced this object; the
/// channel layer only ever asks for the digest of the certified key.
pub trait PeerCert {
    /// Return the SHA-1 digest of the subject key of this certificate.
    fn key_digest(&self) -> [u8; 20];
}

/// Decodes and checks the certificates carried in CERTS cells.
pub trait CertDecoder {
    /// Try to decode a certificate from its encoded body.
    ///
    /// Returns None if the body is not decodable; the handshake
    /// tolerates undecodable certificates of known types.
    fn decode(&self, body: &[u8]) -> Option<Rc<dyn PeerCert>>;
    /// Return true if `cert` is presently valid and correctly signed
    /// by the key certified in `signed_by`.
    ///
    /// Self-signedness is expressed by passing the same certificate
    /// twice.
    fn is_valid(&self, cert: &dyn PeerCert, signed_by: &dyn PeerCert) -> bool;
    /// Construct a new running SHA-256 digest.
    fn new_digest(&self) -> Box<dyn DigestStream>;
}

/// Makes and checks RSA-PKCS1-v1.5 signatures over SHA-256 digests.
pub trait Signer {
    /// Sign SHA-256(`data`) with our authentication key.
    fn sign_sha256(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Return true if `signature` is a correct signature over
    /// SHA-256(`data`) by the key certified in `key_of`.
    fn verify_sha256(&self, key_of: &dyn PeerCert, data: &[u8], signature: &[u8]) -> bool;
}

/// The circuit layer above us, as seen from the channel.
pub trait CircuitLayer {
    /// Note that the network is confirmed up, for timeout estimation.
    fn network_is_live(&self);
    /// Tell every circuit pending on `chan` that the channel attempt
    /// is done: successfully if `success`, otherwise not.
    fn n_chan_done(&self, chan: &Channel, success: bool);
    /// Unlink every circuit attached to `chan`, ending each with
    /// `reason`.
    fn unlink_all_from_channel(&self, chan: &Channel, reason: DestroyReason);
}

/// Returned by a [`GuardManager`] that has decided not to use a
/// channel, even though it connected successfully.
#[derive(Clone, Copy, Debug)]
pub struct GuardRejected;

/// The entry-guard subsystem.
pub trait GuardManager {
    /// Record the outcome of a connection attempt to the guard
    /// identified by `id`.
    ///
    /// An `Err(GuardRejected)` means the subsystem would rather retry
    /// an earlier guard: the caller should cancel circuits pending on
    /// this channel but may keep the channel itself.
    fn register_connect_status(
        &self,
        id: &[u8; 20],
        succeeded: bool,
        now: u64,
    ) -> std::result::Result<(), GuardRejected>;
}

/// The router-descriptor database.
pub trait RouterDb {
    /// Return true if `id` identifies a router we have a descriptor
    /// for.
    fn is_known_router(&self, id: &[u8; 20]) -> bool;
    /// Return true if `id` identifies a trusted directory authority.
    fn is_trusted_dir(&self, id: &[u8; 20]) -> bool;
    /// Record that we completed a connection to `id`.
    fn note_connect_succeeded(&self, id: &[u8; 20], now: u64);
    /// Record whether the router `id` is currently reachable.
    fn set_router_status(&self, id: &[u8; 20], reachable: bool);
}

/// Geoip-based client and directory-request bookkeeping.
pub trait GeoipDb {
    /// Note that a client connected to us over `chan`.
    ///
    /// The implementation is responsible for finding the transport
    /// address of the channel, if it wants one.
    fn note_client_seen(&self, chan: &Channel, now: u64);
    /// Note that the buffer for the directory request with the given
    /// correlation id has been flushed.
    fn dirreq_buffer_flushed(&self, dirreq_id: u64);
}

/// The controller-event sink.
pub trait Controller {
    /// Emit a clock-skew event: our clock appears to differ from the
    /// peer's by `skew` seconds (positive when ours is ahead).
    fn note_clock_skew(&self, skew: i64, peer: &SocketAddr);
}

/// The lower-layer OR TLS connection that a TLS channel is bound to.
///
/// Implementations own the socket, the TLS session, and our own link
/// certificates; the channel layer only tells them what to transmit
/// and asks questions about the session.
pub trait TlsLink {
    /// Append a fixed-length cell to the outgoing buffer.
    fn write_cell(&self, cell: &Cell) -> Result<()>;
    /// Append a variable-length cell to the outgoing buffer.
    fn write_var_cell(&self, cell: &VarCell) -> Result<()>;
    /// Mark this connection to be closed by the event loop.
    fn mark_for_close(&self);
    /// Return true if this connection has been marked for close.
    fn is_marked_for_close(&self) -> bool;
    /// Return the address of the peer.
    fn peer_addr(&self) -> SocketAddr;
    /// Return the address we actually dialed (or accepted from).
    fn real_addr(&self) -> IpAddr;
    /// Return the public addresses we would advertise for ourselves.
    fn local_addrs(&self) -> Vec<IpAddr>;
    /// Return our own certificate chain, encoded for a CERTS cell.
    fn own_certs(&self) -> Vec<(CertKind, Vec<u8>)>;
    /// Return true if `cert` certifies the key that this connection's
    /// TLS session presented.
    fn tls_cert_matches_key(&self, cert: &dyn PeerCert) -> bool;
    /// Compute the deterministic body of an AUTHENTICATE cell from
    /// this session's TLS secrets and the two handshake logs.
    fn compute_authenticator(
        &self,
        client_log: &[u8; 32],
        server_log: &[u8; 32],
    ) -> Result<Vec<u8>>;
    /// Record whether this connection is canonical: the peer lists the
    /// address we dialed among its own.
    fn set_canonical(&self, canonical: bool);
    /// Fix the circuit-ID parity for this connection by comparing our
    /// own identity key with the peer's, and return which half of the
    /// circuit-ID space this side may allocate from.
    ///
    /// `None` resets the parity to the unauthenticated default, in
    /// which the whole space is usable.
    fn set_circ_id_type(&self, peer_cert: Option<&dyn PeerCert>) -> CircIdRange;
    /// (Re)initialize the connection's address-book entry with the
    /// authenticated peer identity, or with no identity at all.
    fn init_peer_identity(&self, id: Option<&[u8; 20]>);
}

/// Launches lower-layer OR TLS connections.
pub trait TlsConnector {
    /// Begin connecting to `addr`:`port`, expecting the identity
    /// `id_digest` at the far end.
    fn connect(&self, addr: IpAddr, port: u16, id_digest: &[u8; 20]) -> Result<Rc<dyn TlsLink>>;
}

/// The bundle of collaborator handles threaded through the channel
/// layer.
pub struct LinkEnv {
    /// Wall-clock time.
    pub clock: Rc<dyn Clock>,
    /// Cryptographic randomness.
    pub rng: Rc<dyn EntropySource>,
    /// Certificate decoding and checking.
    pub certs: Rc<dyn CertDecoder>,
    /// Signature generation and verification.
    pub signer: Rc<dyn Signer>,
    /// The circuit layer above us.
    pub circuits: Rc<dyn CircuitLayer>,
    /// The entry-guard subsystem.
    pub guards: Rc<dyn GuardManager>,
    /// The router-descriptor database.
    pub routers: Rc<dyn RouterDb>,
    /// Geoip bookkeeping.
    pub geoip: Rc<dyn GeoipDb>,
    /// Controller events.
    pub control: Rc<dyn Controller>,
}
