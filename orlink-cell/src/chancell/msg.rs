//! Typed bodies for the messages that are exchanged during channel
//! negotiation.
//!
//! Most cells pass through the channel layer as raw [`Cell`] or
//! [`VarCell`] records without being parsed here; the handshake
//! engine is the main consumer of these types.

use super::{Cell, ChanCmd, VarCell, CELL_DATA_LEN};
use crate::{Error, Result};
use orlink_bytes::{Readable, Reader, Writer};
use std::net::{IpAddr, Ipv4Addr};

use caret::caret_int;

/// Length of the random challenge in an AUTH_CHALLENGE cell.
pub const OR_AUTH_CHALLENGE_LEN: usize = 32;

/// Length of the deterministic prefix of a v3 AUTHENTICATE body.
///
/// The prefix covers the type tag, both certificate digests, both
/// handshake logs, the server TLS certificate digest, and the TLS
/// secret mix.
pub const V3_AUTH_FIXED_PART_LEN: usize = 8 + 32 * 6;

/// Length of a full v3 AUTHENTICATE body, before the signature.
///
/// The body adds 24 random bytes after the fixed part.
pub const V3_AUTH_BODY_LEN: usize = V3_AUTH_FIXED_PART_LEN + 8 + 16;

caret_int! {
    /// The type code of a certificate carried in a CERTS cell.
    pub struct CertKind(u8) {
        /// A TLS link certificate, matching the one used in the TLS
        /// handshake.
        TLS_LINK = 1,
        /// A self-signed identity certificate.
        ID_1024 = 2,
        /// An authentication certificate, signed with the identity key.
        AUTH_1024 = 3,
    }
}

caret_int! {
    /// An authentication method, as used in AUTH_CHALLENGE and
    /// AUTHENTICATE cells.
    pub struct AuthMethod(u16) {
        /// RSA-signed SHA-256 over the handshake logs and TLS secrets.
        RSA_SHA256_TLSSECRET = 1,
    }
}

caret_int! {
    /// Declared reason for ending a circuit.
    pub struct DestroyReason(u8) {
        /// No reason given.
        ///
        /// (This is the only reason that clients send.)
        NONE = 0,
        /// Protocol violation
        PROTOCOL = 1,
        /// Internal error.
        INTERNAL = 2,
        /// Client sent a TRUNCATE command.
        REQUESTED = 3,
        /// Relay is hibernating and not accepting requests
        HIBERNATING = 4,
        /// Ran out of memory, sockets, or circuit IDs
        RESOURCELIMIT = 5,
        /// Couldn't connect to relay.
        CONNECTFAILED = 6,
        /// Connected to a relay, but its OR identity wasn't as requested.
        OR_IDENTITY = 7,
        /// One of the OR channels carrying this circuit died.
        CHANNEL_CLOSED = 8,
        /// Circuit expired for being too dirty or old
        FINISHED = 9,
        /// Circuit construction took too long
        TIMEOUT = 10,
        /// Circuit was destroyed without a client truncate
        DESTROYED = 11,
        /// Request for unknown hidden service
        NOSUCHSERVICE = 12
    }
}

/// Trait for the 'bodies' of channel messages.
pub trait Body: Readable {
    /// The channel command that labels this message type.
    fn cmd() -> ChanCmd;
    /// Consume this message and encode its body onto `w`.
    ///
    /// Does not encode anything _but_ the cell body, and does not pad
    /// to the cell length.
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W);

    /// Try to decode a message of this type from a cell payload.
    ///
    /// Trailing zero-padding (as found in fixed-length cells) is
    /// permitted and ignored.
    fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::from_slice(payload);
        let msg = Self::take_from(&mut r)?;
        Ok(msg)
    }

    /// Consume this message and wrap it into a variable-length cell
    /// with a zero circuit ID.
    ///
    /// Only meaningful for commands with the variable-length format.
    fn into_var_cell(self) -> VarCell {
        debug_assert!(Self::cmd().is_var_cell());
        let mut body = Vec::new();
        self.write_body_onto(&mut body);
        VarCell::new(0.into(), Self::cmd(), body)
    }

    /// Consume this message and wrap it into a zero-padded
    /// fixed-length cell with a zero circuit ID.
    ///
    /// Returns an error if the body is too long for a fixed cell.
    fn into_fixed_cell(self) -> Result<Cell> {
        debug_assert!(!Self::cmd().is_var_cell());
        let mut body = Vec::new();
        self.write_body_onto(&mut body);
        if body.len() > CELL_DATA_LEN {
            return Err(Error::CantEncode);
        }
        let mut cell = Cell::new(0.into(), Self::cmd());
        cell.payload_mut()[..body.len()].copy_from_slice(&body[..]);
        Ok(cell)
    }
}

/// A Versions message begins channel negotiation.
///
/// Every channel must begin by sending a Versions message.  This
/// message lists the link protocol versions that this implementation
/// supports.
///
/// Note that Versions cells are never sent using the usual channel
/// cell encoding: Versions cells _always_ use two-byte circuit IDs,
/// whereas all the other cell types use four-byte circuit IDs
/// [assuming a recent version is negotiated].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versions {
    /// List of supported link protocol versions
    versions: Vec<u16>,
}
impl Versions {
    /// Construct a new Versions message using a provided list of link
    /// protocols.
    ///
    /// Returns an error if the list of versions is too long.
    pub fn new<B>(vs: B) -> Result<Self>
    where
        B: Into<Vec<u16>>,
    {
        let versions = vs.into();
        if versions.len() < (u16::MAX / 2) as usize {
            Ok(Self { versions })
        } else {
            Err(Error::CantEncode)
        }
    }
    /// Encode this VERSIONS cell in the manner expected for a handshake.
    ///
    /// (That's different from a standard cell encoding, since we
    /// have not negotiated versions yet, and so our circuit-ID length
    /// is an obsolete 2 bytes).
    pub fn encode_for_handshake(self) -> Vec<u8> {
        let mut v = Vec::new();
        v.write_u16(0); // obsolete circuit ID.
        v.write_u8(ChanCmd::VERSIONS.into());
        v.write_u16((self.versions.len() * 2) as u16); // message length.
        self.write_body_onto(&mut v);
        v
    }
    /// Return the best (numerically highest) link protocol that is
    /// shared by this versions cell and my_protos.
    pub fn best_shared_link_protocol(&self, my_protos: &[u16]) -> Option<u16> {
        // NOTE: this implementation is quadratic, but it shouldn't matter
        // much so long as my_protos is small.
        let p = my_protos
            .iter()
            .filter(|p| self.versions.contains(p))
            .fold(0_u16, |a, b| u16::max(a, *b));
        if p == 0 {
            None
        } else {
            Some(p)
        }
    }
}
impl Body for Versions {
    fn cmd() -> ChanCmd {
        ChanCmd::VERSIONS
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        for v in self.versions.iter() {
            w.write_u16(*v);
        }
    }
}
impl Readable for Versions {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let mut versions = Vec::new();
        while r.remaining() > 0 {
            versions.push(r.take_u16()?);
        }
        Ok(Versions { versions })
    }
}

/// The netinfo message ends channel negotiation.
///
/// It tells the other party on the channel our view of the current
/// time, our own list of public addresses, and our view of its
/// address.
///
/// When we get a netinfo cell, we can start creating circuits on a
/// channel and sending data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Netinfo {
    /// Time when this cell was sent, or 0 if this cell is sent by a
    /// client.
    timestamp: u32,
    /// Observed address for the party that did not send the netinfo
    /// cell.
    their_addr: Option<IpAddr>,
    /// Canonical addresses for the party that did send the netinfo
    /// cell.
    my_addr: Vec<IpAddr>,
}
/// helper: encode a single address in the form that netinfo messages expect
fn enc_one_netinfo_addr<W: Writer + ?Sized>(w: &mut W, addr: &IpAddr) {
    match addr {
        IpAddr::V4(ipv4) => {
            w.write_u8(0x04); // type.
            w.write_u8(4); // length.
            w.write_all(&ipv4.octets()[..]);
        }
        IpAddr::V6(ipv6) => {
            w.write_u8(0x06); // type.
            w.write_u8(16); // length.
            w.write_all(&ipv6.octets()[..]);
        }
    }
}
/// helper: take an address as encoded in a netinfo message.
///
/// Addresses of unrecognized types, and addresses whose lengths don't
/// match their types, decode to None but still consume their bytes.
fn take_one_netinfo_addr(r: &mut Reader<'_>) -> orlink_bytes::Result<Option<IpAddr>> {
    let atype = r.take_u8()?;
    let alen = r.take_u8()?;
    let abody = r.take(alen as usize)?;
    match (atype, alen) {
        (0x04, 4) => {
            let bytes = [abody[0], abody[1], abody[2], abody[3]];
            Ok(Some(IpAddr::V4(bytes.into())))
        }
        (0x06, 16) => {
            let mut bytes = [0_u8; 16];
            bytes.copy_from_slice(abody);
            Ok(Some(IpAddr::V6(bytes.into())))
        }
        (_, _) => Ok(None),
    }
}
impl Netinfo {
    /// Construct a new Netinfo to be sent by a client.
    ///
    /// Clients do not report their own timestamps or addresses.
    pub fn for_client(their_addr: Option<IpAddr>) -> Self {
        Netinfo {
            timestamp: 0,
            their_addr,
            my_addr: Vec::new(),
        }
    }
    /// Construct a new Netinfo to be sent by a relay.
    pub fn for_relay<V>(timestamp: u32, their_addr: Option<IpAddr>, my_addrs: V) -> Self
    where
        V: Into<Vec<IpAddr>>,
    {
        let my_addr = my_addrs.into();
        Netinfo {
            timestamp,
            their_addr,
            my_addr,
        }
    }
    /// Return the timestamp that the sender reported.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }
    /// Return the address that the sender believes the recipient has.
    pub fn their_addr(&self) -> Option<&IpAddr> {
        self.their_addr.as_ref()
    }
    /// Return the list of addresses the sender claims for itself.
    pub fn my_addrs(&self) -> &[IpAddr] {
        &self.my_addr[..]
    }
}
impl Body for Netinfo {
    fn cmd() -> ChanCmd {
        ChanCmd::NETINFO
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_u32(self.timestamp);
        let their_addr = self
            .their_addr
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.into());
        enc_one_netinfo_addr(w, &their_addr);
        assert!(self.my_addr.len() <= u8::MAX as usize);
        w.write_u8(self.my_addr.len() as u8);
        for addr in self.my_addr.iter() {
            enc_one_netinfo_addr(w, addr);
        }
    }
}
impl Readable for Netinfo {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let timestamp = r.take_u32()?;
        let their_addr = take_one_netinfo_addr(r)?.filter(|a| !a.is_unspecified());
        let mut my_addr = Vec::new();
        let my_n_addrs = r.take_u8()?;
        for _ in 0..my_n_addrs {
            if let Some(a) = take_one_netinfo_addr(r)? {
                my_addr.push(a);
            }
        }
        Ok(Netinfo {
            timestamp,
            their_addr,
            my_addr,
        })
    }
}

/// A single certificate in a Certs cell.
///
/// The body is kept as encoded bytes; decoding and validity checks
/// happen at a higher layer.
#[derive(Clone, Debug)]
struct LinkCert {
    /// Type code for this certificate.
    certtype: CertKind,
    /// Encoded certificate
    cert: Vec<u8>,
}
/// encode a single LinkCert `c` onto a Writer `w`.
fn enc_one_cert<W: Writer + ?Sized>(w: &mut W, c: &LinkCert) {
    w.write_u8(c.certtype.into());
    assert!(c.cert.len() <= u16::MAX as usize);
    w.write_u16(c.cert.len() as u16);
    w.write_all(&c.cert[..]);
}
/// Try to extract a LinkCert from the reader `r`.
fn take_one_cert(r: &mut Reader<'_>) -> orlink_bytes::Result<LinkCert> {
    let certtype = r.take_u8()?;
    let certlen = r.take_u16()?;
    let cert = r.take(certlen as usize)?;
    Ok(LinkCert {
        certtype: certtype.into(),
        cert: cert.into(),
    })
}

/// A Certs message is used as part of the channel handshake to send
/// additional certificates.
///
/// These certificates are not presented as part of the TLS handshake.
/// Every relay sends this message as part of channel negotiation;
/// clients do not send them.
#[derive(Clone, Debug)]
pub struct Certs {
    /// The certificates in this cell, in their original order.
    certs: Vec<LinkCert>,
}
impl Certs {
    /// Return a new empty certs cell.
    pub fn new_empty() -> Self {
        Certs { certs: Vec::new() }
    }
    /// Add a new encoded certificate to this cell.
    ///
    /// Does not check anything about the well-formedness of the
    /// certificate.
    pub fn push_cert_body<B>(&mut self, certtype: CertKind, cert: B)
    where
        B: Into<Vec<u8>>,
    {
        let cert = cert.into();
        self.certs.push(LinkCert { certtype, cert });
    }

    /// Return the body of the first certificate tagged with 'tp', if
    /// any.
    pub fn cert_body(&self, tp: CertKind) -> Option<&[u8]> {
        self.certs
            .iter()
            .find(|c| c.certtype == tp)
            .map(|c| &c.cert[..])
    }

    /// Return an iterator over (type, body) pairs, in the order they
    /// appeared in the cell.
    pub fn iter(&self) -> impl Iterator<Item = (CertKind, &[u8])> {
        self.certs.iter().map(|c| (c.certtype, &c.cert[..]))
    }

    /// Return the number of certificates in this cell.
    pub fn n_certs(&self) -> usize {
        self.certs.len()
    }
}

impl Body for Certs {
    fn cmd() -> ChanCmd {
        ChanCmd::CERTS
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        assert!(self.certs.len() <= u8::MAX as usize);
        w.write_u8(self.certs.len() as u8);
        for c in self.certs.iter() {
            enc_one_cert(w, c);
        }
    }
}
impl Readable for Certs {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let n = r.take_u8()?;
        let mut certs = Vec::new();
        for _ in 0..n {
            certs.push(take_one_cert(r)?);
        }
        Ok(Certs { certs })
    }
}

/// An AuthChallenge message is part of negotiation, sent by responders
/// to initiators.
///
/// The AuthChallenge cell is used to ensure that some unpredictable
/// material has been sent on the channel, and to tell the initiator
/// what authentication methods will be accepted.
///
/// Clients can safely ignore this message: they don't need to
/// authenticate.
#[derive(Clone, Debug)]
pub struct AuthChallenge {
    /// Random challenge to be used in generating response
    challenge: [u8; OR_AUTH_CHALLENGE_LEN],
    /// List of permitted authentication methods
    methods: Vec<u16>,
}
impl AuthChallenge {
    /// Construct a new AuthChallenge cell with a given challenge value
    /// (chosen randomly) and a set of acceptable authentication
    /// methods.
    pub fn new<B, M>(challenge: B, methods: M) -> Self
    where
        B: Into<[u8; OR_AUTH_CHALLENGE_LEN]>,
        M: Into<Vec<u16>>,
    {
        AuthChallenge {
            challenge: challenge.into(),
            methods: methods.into(),
        }
    }
    /// Return true if the given method is offered by this challenge.
    pub fn offers(&self, method: AuthMethod) -> bool {
        self.methods.contains(&method.into())
    }
    /// Return the challenge bytes.
    pub fn challenge(&self) -> &[u8; OR_AUTH_CHALLENGE_LEN] {
        &self.challenge
    }
}
impl Body for AuthChallenge {
    fn cmd() -> ChanCmd {
        ChanCmd::AUTH_CHALLENGE
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_all(&self.challenge[..]);
        assert!(self.methods.len() <= u16::MAX as usize);
        w.write_u16(self.methods.len() as u16);
        for m in self.methods.iter() {
            w.write_u16(*m);
        }
    }
}
impl Readable for AuthChallenge {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let challenge = r.extract()?;
        let n_methods = r.take_u16()?;
        let mut methods = Vec::new();
        for _ in 0..n_methods {
            methods.push(r.take_u16()?);
        }
        Ok(AuthChallenge { challenge, methods })
    }
}

/// Part of negotiation: sent by initiators to responders.
///
/// The Authenticate cell proves the initiator's identity to the
/// responder, even if TLS client authentication was not used.
///
/// Clients do not use this.
#[derive(Clone, Debug)]
pub struct Authenticate {
    /// Authentication method in use
    authtype: u16,
    /// Encoded authentication object
    auth: Vec<u8>,
}
impl Authenticate {
    /// Create a new Authenticate message from a given type and body.
    pub fn new<B>(authtype: AuthMethod, body: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        Authenticate {
            authtype: authtype.into(),
            auth: body.into(),
        }
    }
    /// Return the authentication method of this message.
    pub fn authtype(&self) -> AuthMethod {
        self.authtype.into()
    }
    /// Return the body of this message.
    pub fn body(&self) -> &[u8] {
        &self.auth[..]
    }
}
impl Body for Authenticate {
    fn cmd() -> ChanCmd {
        ChanCmd::AUTHENTICATE
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_u16(self.authtype);
        assert!(self.auth.len() <= u16::MAX as usize);
        w.write_u16(self.auth.len() as u16);
        w.write_all(&self.auth[..]);
    }
}
impl Readable for Authenticate {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let authtype = r.take_u16()?;
        let authlen = r.take_u16()?;
        let auth = r.take(authlen as usize)?.into();
        Ok(Authenticate { authtype, auth })
    }
}

/// The Authorize message type is not yet used.
#[derive(Clone, Debug)]
pub struct Authorize {
    /// The cell's content, which isn't really specified yet.
    content: Vec<u8>,
}
impl Authorize {
    /// Construct a new Authorize cell.
    pub fn new<B>(content: B) -> Self
    where
        B: Into<Vec<u8>>,
    {
        let content = content.into();
        Authorize { content }
    }
}
impl Body for Authorize {
    fn cmd() -> ChanCmd {
        ChanCmd::AUTHORIZE
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_all(&self.content[..])
    }
}
impl Readable for Authorize {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        Ok(Authorize {
            content: r.take(r.remaining())?.into(),
        })
    }
}

/// The Destroy message tears down a circuit.
///
/// On receiving a Destroy message, an implementation should tear down
/// the associated circuit, and pass the destroy message along the
/// circuit to later/earlier hops (if any).
#[derive(Clone, Debug)]
pub struct Destroy {
    /// Reason code given for tearing down this circuit
    reason: DestroyReason,
}
impl Destroy {
    /// Create a new destroy message.
    pub fn new(reason: DestroyReason) -> Self {
        Destroy { reason }
    }
    /// Return the provided reason for destroying the circuit.
    pub fn reason(&self) -> DestroyReason {
        self.reason
    }
}
impl Body for Destroy {
    fn cmd() -> ChanCmd {
        ChanCmd::DESTROY
    }
    fn write_body_onto<W: Writer + ?Sized>(self, w: &mut W) {
        w.write_u8(self.reason.into())
    }
}
impl Readable for Destroy {
    fn take_from(r: &mut Reader<'_>) -> orlink_bytes::Result<Self> {
        let reason = r.take_u8()?.into();
        Ok(Destroy { reason })
    }
}
