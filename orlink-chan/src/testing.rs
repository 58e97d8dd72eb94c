//! Stub collaborators for testing the channel layer.
//!
//! Every interface in [`crate::external`] gets a recording fake here,
//! plus a fake transport and a fake lower-layer connection, so that
//! the channel and handshake tests can run without any real network,
//! clock, or cryptography.

use crate::channel::{Channel, CircIdRange, Transport, UniqId};
use crate::external::{
    CertDecoder, CircuitLayer, Clock, Controller, DigestStream, EntropySource, GeoipDb,
    GuardManager, GuardRejected, LinkEnv, PeerCert, RouterDb, Signer, TlsConnector, TlsLink,
};
use crate::Result;
use orlink_cell::chancell::msg::{CertKind, V3_AUTH_BODY_LEN};
use orlink_cell::chancell::{AnyCell, Cell, ChanCmd, VarCell};

use std::cell::{Cell as StdCell, RefCell};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

/// A clock whose time is set by the test.
pub(crate) struct FakeClock {
    /// The current "time".
    now: StdCell<u64>,
}
impl FakeClock {
    /// Move the clock to `t`.
    pub(crate) fn set(&self, t: u64) {
        self.now.set(t);
    }
}
impl Clock for FakeClock {
    fn now(&self) -> u64 {
        self.now.get()
    }
}

/// Deterministic "randomness".
pub(crate) struct FakeEntropy;
impl EntropySource for FakeEntropy {
    fn fill_bytes(&self, out: &mut [u8]) {
        out.fill(0x5a);
    }
    fn pick_u16(&self, bound: u16) -> u16 {
        0x1234 % bound
    }
}

/// A "digest" that remembers everything appended to it.
struct FakeDigest {
    /// Shared transcript of the appended bytes.
    log: Rc<RefCell<Vec<u8>>>,
}
impl DigestStream for FakeDigest {
    fn append(&mut self, data: &[u8]) {
        self.log.borrow_mut().extend_from_slice(data);
    }
    fn finalize(&self) -> [u8; 32] {
        // Not a real hash; mash the transcript into 32 bytes so that
        // different transcripts are overwhelmingly likely to differ.
        let mut out = [0_u8; 32];
        for (i, b) in self.log.borrow().iter().enumerate() {
            out[i % 32] ^= *b;
            out[(i + 7) % 32] = out[(i + 7) % 32].wrapping_add(*b);
        }
        out
    }
}

/// A decoded fake certificate.
///
/// The encoding is one byte long: a body `[d]` decodes to a
/// certificate whose key digest is `[d; 20]`.
struct FakeCert {
    /// The pretend subject-key digest.
    digest: [u8; 20],
}
impl PeerCert for FakeCert {
    fn key_digest(&self) -> [u8; 20] {
        self.digest
    }
}

/// Fake certificate decoder and digest factory.
pub(crate) struct FakeCrypto {
    /// (cert digest, signer digest) pairs that count as validly
    /// signed.
    valid: RefCell<HashSet<([u8; 20], [u8; 20])>>,
    /// Transcripts of every digest stream handed out, in creation
    /// order.
    pub(crate) digest_logs: RefCell<Vec<Rc<RefCell<Vec<u8>>>>>,
}
impl FakeCrypto {
    /// Declare that the certificate with key digest `[cert; 20]` is
    /// validly signed by the key with digest `[signer; 20]`.
    pub(crate) fn allow(&self, cert: u8, signer: u8) {
        self.valid
            .borrow_mut()
            .insert(([cert; 20], [signer; 20]));
    }
}
impl CertDecoder for FakeCrypto {
    fn decode(&self, body: &[u8]) -> Option<Rc<dyn PeerCert>> {
        let first = *body.first()?;
        Some(Rc::new(FakeCert {
            digest: [first; 20],
        }))
    }
    fn is_valid(&self, cert: &dyn PeerCert, signed_by: &dyn PeerCert) -> bool {
        self.valid
            .borrow()
            .contains(&(cert.key_digest(), signed_by.key_digest()))
    }
    fn new_digest(&self) -> Box<dyn DigestStream> {
        let log = Rc::new(RefCell::new(Vec::new()));
        self.digest_logs.borrow_mut().push(Rc::clone(&log));
        Box::new(FakeDigest { log })
    }
}

/// Fake signature maker and checker.
pub(crate) struct FakeSigner {
    /// Whether signature verification should succeed.
    pub(crate) verify_ok: StdCell<bool>,
    /// How many signatures we've been asked to verify.
    pub(crate) n_verified: StdCell<usize>,
}
impl Signer for FakeSigner {
    fn sign_sha256(&self, _data: &[u8]) -> Result<Vec<u8>> {
        Ok(vec![0xab_u8; 128])
    }
    fn verify_sha256(&self, _key_of: &dyn PeerCert, _data: &[u8], _signature: &[u8]) -> bool {
        self.n_verified.set(self.n_verified.get() + 1);
        self.verify_ok.get()
    }
}

/// Something the channel told the circuit layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum CircEvent {
    /// network_is_live was called.
    NetworkLive,
    /// n_chan_done was called with this channel and outcome.
    NChanDone(UniqId, bool),
    /// unlink_all_from_channel was called with this reason.
    Unlink(UniqId, u8),
}

/// Recording fake circuit layer.
pub(crate) struct FakeCircuits {
    /// Everything we were told, in order.
    pub(crate) events: RefCell<Vec<CircEvent>>,
}
impl CircuitLayer for FakeCircuits {
    fn network_is_live(&self) {
        self.events.borrow_mut().push(CircEvent::NetworkLive);
    }
    fn n_chan_done(&self, chan: &Channel, success: bool) {
        self.events
            .borrow_mut()
            .push(CircEvent::NChanDone(chan.unique_id(), success));
    }
    fn unlink_all_from_channel(
        &self,
        chan: &Channel,
        reason: orlink_cell::chancell::msg::DestroyReason,
    ) {
        self.events
            .borrow_mut()
            .push(CircEvent::Unlink(chan.unique_id(), reason.into()));
    }
}

/// Recording fake guard manager.
pub(crate) struct FakeGuards {
    /// Whether the next registration should be rejected.
    pub(crate) reject: StdCell<bool>,
    /// The registrations we saw.
    pub(crate) calls: RefCell<Vec<([u8; 20], bool, u64)>>,
}
impl GuardManager for FakeGuards {
    fn register_connect_status(
        &self,
        id: &[u8; 20],
        succeeded: bool,
        now: u64,
    ) -> std::result::Result<(), GuardRejected> {
        self.calls.borrow_mut().push((*id, succeeded, now));
        if self.reject.get() {
            Err(GuardRejected)
        } else {
            Ok(())
        }
    }
}

/// Fake router database.
pub(crate) struct FakeRouters {
    /// Identities with descriptors.
    pub(crate) known: RefCell<HashSet<[u8; 20]>>,
    /// Identities of trusted directories.
    pub(crate) trusted: RefCell<HashSet<[u8; 20]>>,
    /// Recorded reachability updates.
    pub(crate) statuses: RefCell<Vec<([u8; 20], bool)>>,
}
impl RouterDb for FakeRouters {
    fn is_known_router(&self, id: &[u8; 20]) -> bool {
        self.known.borrow().contains(id)
    }
    fn is_trusted_dir(&self, id: &[u8; 20]) -> bool {
        self.trusted.borrow().contains(id)
    }
    fn note_connect_succeeded(&self, _id: &[u8; 20], _now: u64) {}
    fn set_router_status(&self, id: &[u8; 20], reachable: bool) {
        self.statuses.borrow_mut().push((*id, reachable));
    }
}

/// Recording fake geoip database.
pub(crate) struct FakeGeoip {
    /// How many client sightings were reported.
    pub(crate) clients_seen: StdCell<usize>,
    /// Directory requests whose buffers were flushed.
    pub(crate) flushed: RefCell<Vec<u64>>,
}
impl GeoipDb for FakeGeoip {
    fn note_client_seen(&self, _chan: &Channel, _now: u64) {
        self.clients_seen.set(self.clients_seen.get() + 1);
    }
    fn dirreq_buffer_flushed(&self, dirreq_id: u64) {
        self.flushed.borrow_mut().push(dirreq_id);
    }
}

/// Recording fake controller.
pub(crate) struct FakeControl {
    /// Clock-skew events, in seconds.
    pub(crate) skews: RefCell<Vec<i64>>,
}
impl Controller for FakeControl {
    fn note_clock_skew(&self, skew: i64, _peer: &SocketAddr) {
        self.skews.borrow_mut().push(skew);
    }
}

/// The typed handles to every fake, so tests can poke and inspect
/// them after building a [`LinkEnv`].
pub(crate) struct TestNet {
    /// The fake clock.
    pub(crate) clock: Rc<FakeClock>,
    /// The fake certificate machinery.
    pub(crate) crypto: Rc<FakeCrypto>,
    /// The fake signer.
    pub(crate) signer: Rc<FakeSigner>,
    /// The fake circuit layer.
    pub(crate) circuits: Rc<FakeCircuits>,
    /// The fake guard manager.
    pub(crate) guards: Rc<FakeGuards>,
    /// The fake router database.
    pub(crate) routers: Rc<FakeRouters>,
    /// The fake geoip database.
    pub(crate) geoip: Rc<FakeGeoip>,
    /// The fake controller.
    pub(crate) control: Rc<FakeControl>,
}

/// Build a [`LinkEnv`] of fakes, returning the typed handles too.
pub(crate) fn new_env() -> (Rc<LinkEnv>, TestNet) {
    let clock = Rc::new(FakeClock {
        now: StdCell::new(1_000_000),
    });
    let crypto = Rc::new(FakeCrypto {
        valid: RefCell::new(HashSet::new()),
        digest_logs: RefCell::new(Vec::new()),
    });
    let signer = Rc::new(FakeSigner {
        verify_ok: StdCell::new(true),
        n_verified: StdCell::new(0),
    });
    let circuits = Rc::new(FakeCircuits {
        events: RefCell::new(Vec::new()),
    });
    let guards = Rc::new(FakeGuards {
        reject: StdCell::new(false),
        calls: RefCell::new(Vec::new()),
    });
    let routers = Rc::new(FakeRouters {
        known: RefCell::new(HashSet::new()),
        trusted: RefCell::new(HashSet::new()),
        statuses: RefCell::new(Vec::new()),
    });
    let geoip = Rc::new(FakeGeoip {
        clients_seen: StdCell::new(0),
        flushed: RefCell::new(Vec::new()),
    });
    let control = Rc::new(FakeControl {
        skews: RefCell::new(Vec::new()),
    });
    let env = Rc::new(LinkEnv {
        clock: clock.clone(),
        rng: Rc::new(FakeEntropy),
        certs: crypto.clone(),
        signer: signer.clone(),
        circuits: circuits.clone(),
        guards: guards.clone(),
        routers: routers.clone(),
        geoip: geoip.clone(),
        control: control.clone(),
    });
    let net = TestNet {
        clock,
        crypto,
        signer,
        circuits,
        guards,
        routers,
        geoip,
        control,
    };
    (env, net)
}

/// A transport that records what the channel hands it.
pub(crate) struct FakeTransport {
    /// Cells written through us, in order.
    pub(crate) written: RefCell<Vec<AnyCell>>,
    /// Whether close() has been invoked.
    pub(crate) closed: StdCell<bool>,
}
impl FakeTransport {
    /// Make a new idle transport.
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(FakeTransport {
            written: RefCell::new(Vec::new()),
            closed: StdCell::new(false),
        })
    }
    /// Return the commands of the cells written so far.
    pub(crate) fn cmds(&self) -> Vec<ChanCmd> {
        self.written.borrow().iter().map(|c| c.cmd()).collect()
    }
}
/// Install a fake transport on a channel, coercing it to the trait
/// object the slot expects.
pub(crate) fn install_transport(chan: &Channel, transport: &Rc<FakeTransport>) {
    let t: Rc<dyn Transport> = Rc::clone(transport) as Rc<dyn Transport>;
    chan.set_transport(Some(t));
}

impl Transport for FakeTransport {
    fn close(&self, _chan: &Channel) {
        self.closed.set(true);
    }
    fn write_cell(&self, _chan: &Channel, cell: Cell) {
        self.written.borrow_mut().push(AnyCell::Fixed(cell));
    }
    fn write_var_cell(&self, _chan: &Channel, cell: VarCell) {
        self.written.borrow_mut().push(AnyCell::Var(cell));
    }
}

/// A fake lower-layer OR TLS connection.
pub(crate) struct FakeConn {
    /// Cells written to the wire, in order.
    pub(crate) written: RefCell<Vec<AnyCell>>,
    /// Whether the connection has been marked for close.
    pub(crate) marked: StdCell<bool>,
    /// The peer's address.
    pub(crate) peer: SocketAddr,
    /// The address we dialed.
    pub(crate) real: StdCell<IpAddr>,
    /// Our own advertised addresses.
    pub(crate) locals: RefCell<Vec<IpAddr>>,
    /// Our own certificate chain for CERTS cells.
    pub(crate) certs_out: RefCell<Vec<(CertKind, Vec<u8>)>>,
    /// Whether the peer's link certificate matches the TLS key.
    pub(crate) tls_match: StdCell<bool>,
    /// Canned authenticator body.
    pub(crate) authenticator: RefCell<Vec<u8>>,
    /// Whether computing the authenticator should fail.
    pub(crate) auth_err: StdCell<bool>,
    /// What set_canonical was last told, if anything.
    pub(crate) canonical: StdCell<Option<bool>>,
    /// Recorded set_circ_id_type calls (peer key digest, or None).
    pub(crate) parity: RefCell<Vec<Option<[u8; 20]>>>,
    /// The circuit-ID range the connection assigns once the peer's
    /// identity key is known.
    pub(crate) parity_choice: StdCell<CircIdRange>,
    /// Recorded init_peer_identity calls.
    pub(crate) peer_ids: RefCell<Vec<Option<[u8; 20]>>>,
    /// Whether writes should fail.
    pub(crate) write_err: StdCell<bool>,
}
impl FakeConn {
    /// Make a new healthy connection to a canned peer address.
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(FakeConn {
            written: RefCell::new(Vec::new()),
            marked: StdCell::new(false),
            peer: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)), 9001),
            real: StdCell::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5))),
            locals: RefCell::new(vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7))]),
            certs_out: RefCell::new(Vec::new()),
            tls_match: StdCell::new(true),
            authenticator: RefCell::new(vec![0xa5_u8; V3_AUTH_BODY_LEN]),
            auth_err: StdCell::new(false),
            canonical: StdCell::new(None),
            parity: RefCell::new(Vec::new()),
            parity_choice: StdCell::new(CircIdRange::Low),
            peer_ids: RefCell::new(Vec::new()),
            write_err: StdCell::new(false),
        })
    }
    /// Return the commands of the cells written so far.
    pub(crate) fn cmds(&self) -> Vec<ChanCmd> {
        self.written.borrow().iter().map(|c| c.cmd()).collect()
    }
}
impl TlsLink for FakeConn {
    fn write_cell(&self, cell: &Cell) -> Result<()> {
        if self.write_err.get() {
            return Err(crate::Error::Internal("wire unwritable".into()));
        }
        self.written.borrow_mut().push(AnyCell::Fixed(cell.clone()));
        Ok(())
    }
    fn write_var_cell(&self, cell: &VarCell) -> Result<()> {
        if self.write_err.get() {
            return Err(crate::Error::Internal("wire unwritable".into()));
        }
        self.written.borrow_mut().push(AnyCell::Var(cell.clone()));
        Ok(())
    }
    fn mark_for_close(&self) {
        self.marked.set(true);
    }
    fn is_marked_for_close(&self) -> bool {
        self.marked.get()
    }
    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
    fn real_addr(&self) -> IpAddr {
        self.real.get()
    }
    fn local_addrs(&self) -> Vec<IpAddr> {
        self.locals.borrow().clone()
    }
    fn own_certs(&self) -> Vec<(CertKind, Vec<u8>)> {
        self.certs_out.borrow().clone()
    }
    fn tls_cert_matches_key(&self, _cert: &dyn PeerCert) -> bool {
        self.tls_match.get()
    }
    fn compute_authenticator(
        &self,
        _client_log: &[u8; 32],
        _server_log: &[u8; 32],
    ) -> Result<Vec<u8>> {
        if self.auth_err.get() {
            return Err(crate::Error::Internal("no TLS secrets".into()));
        }
        Ok(self.authenticator.borrow().clone())
    }
    fn set_canonical(&self, canonical: bool) {
        self.canonical.set(Some(canonical));
    }
    fn set_circ_id_type(&self, peer_cert: Option<&dyn PeerCert>) -> CircIdRange {
        self.parity.borrow_mut().push(peer_cert.map(|c| c.key_digest()));
        match peer_cert {
            Some(_) => self.parity_choice.get(),
            None => CircIdRange::All,
        }
    }
    fn init_peer_identity(&self, id: Option<&[u8; 20]>) {
        self.peer_ids.borrow_mut().push(id.copied());
    }
}

/// A connector that hands out one prepared [`FakeConn`].
pub(crate) struct FakeConnector {
    /// The connection to return.
    pub(crate) conn: Rc<FakeConn>,
    /// Whether the connection attempt should fail instead.
    pub(crate) fail: StdCell<bool>,
}
impl TlsConnector for FakeConnector {
    fn connect(
        &self,
        _addr: IpAddr,
        _port: u16,
        _id_digest: &[u8; 20],
    ) -> Result<Rc<dyn TlsLink>> {
        if self.fail.get() {
            return Err(crate::Error::Internal("no route to relay".into()));
        }
        let conn: Rc<dyn TlsLink> = Rc::clone(&self.conn) as Rc<dyn TlsLink>;
        Ok(conn)
    }
}
