//! The link handshake engine.
//!
//! Inputs are the VERSIONS, CERTS, AUTH_CHALLENGE, AUTHENTICATE, and
//! NETINFO cells that the transport feeds us before the connection is
//! open; outputs are either further cells on the wire or an
//! authenticated open channel.  Both the initiator and the responder
//! sides are implemented here.

use super::{OrConnState, TlsChannel};
use crate::external::PeerCert;
use crate::{Error, Result};
use orlink_cell::chancell::msg::{
    AuthChallenge, AuthMethod, Authenticate, Body, CertKind, Certs, Netinfo, Versions,
    OR_AUTH_CHALLENGE_LEN, V3_AUTH_BODY_LEN, V3_AUTH_FIXED_PART_LEN,
};
use crate::external::DigestStream;
use orlink_bytes::Writer;
use orlink_cell::chancell::{Cell, ChanCmd, VarCell};

use std::rc::Rc;

use tracing::{debug, info, warn};

/// A list of the link protocols that we support.
pub(crate) static LINK_PROTOCOLS: &[u16] = &[2, 3, 4];

/// Warn when a peer's NETINFO timestamp is off from ours by at least
/// this many seconds.
const NETINFO_NOTICE_SKEW: i64 = 3600;

/// Measure skew only if the NETINFO arrived within this many seconds
/// of our own VERSIONS cell.
const NETINFO_TIMEOUT: i64 = 180;

/// State of a link handshake in progress on one TLS channel.
pub(super) struct HandshakeState {
    /// True if we initiated this connection.
    started_here: bool,
    /// When we sent our VERSIONS cell, or 0 if we haven't.
    sent_versions_at: u64,
    /// True once a VERSIONS cell has been received.
    received_versions: bool,
    /// True once a CERTS cell has been received.
    received_certs_cell: bool,
    /// True once an AUTH_CHALLENGE cell has been received.
    received_auth_challenge: bool,
    /// True once an AUTHENTICATE cell has been received.
    received_authenticate: bool,
    /// True once the peer has proven its identity.
    authenticated: bool,
    /// SHA-1 digest of the authenticated peer identity key; zero
    /// until authentication.
    authenticated_peer_id: [u8; 20],
    /// The peer's identity certificate, once received and checked.
    id_cert: Option<Rc<dyn PeerCert>>,
    /// The peer's authentication certificate (responder side only).
    auth_cert: Option<Rc<dyn PeerCert>>,
    /// The peer's link certificate (initiator side only).
    link_cert: Option<Rc<dyn PeerCert>>,
    /// Running digest of the handshake cells we have sent.
    digest_sent: Box<dyn DigestStream>,
    /// Running digest of the handshake cells we have received.
    digest_rcvd: Box<dyn DigestStream>,
    /// False once an AUTHENTICATE cell has been accepted: nothing
    /// received after it is part of the authenticated log.
    record_rcvd: bool,
}

impl TlsChannel {
    /// Install a fresh handshake state for this connection.
    pub(super) fn init_handshake_state(&self, started_here: bool) {
        let decoder = &self.env.certs;
        *self.hs.borrow_mut() = Some(HandshakeState {
            started_here,
            sent_versions_at: 0,
            received_versions: false,
            received_certs_cell: false,
            received_auth_challenge: false,
            received_authenticate: false,
            authenticated: false,
            authenticated_peer_id: [0_u8; 20],
            id_cert: None,
            auth_cert: None,
            link_cert: None,
            digest_sent: decoder.new_digest(),
            digest_rcvd: decoder.new_digest(),
            record_rcvd: true,
        });
    }

    /// Run `f` on the handshake state, which must exist.
    ///
    /// The borrow lasts only for the call, so `f` must not reenter
    /// the handshake.
    fn with_hs<T>(&self, f: impl FnOnce(&mut HandshakeState) -> T) -> Result<T> {
        let mut hs = self.hs.borrow_mut();
        match hs.as_mut() {
            Some(h) => Ok(f(h)),
            None => Err(Error::Internal(
                "no handshake state on this connection".into(),
            )),
        }
    }

    /// Check a handshake-cell precondition: on failure, close and
    /// report a bad cell of the given kind.
    fn check_cell(&self, ok: bool, kind: &str, why: &str) -> Result<()> {
        if ok {
            Ok(())
        } else {
            Err(self.bad_cell(kind, why))
        }
    }

    /// Encode a fixed-length cell the way it appeared on the wire, for
    /// the handshake logs.
    fn encode_cell_for_log(&self, cell: &Cell) -> Vec<u8> {
        let mut v = Vec::new();
        if self.link_proto.get() >= 4 {
            v.write_u32(cell.circid().into());
        } else {
            v.write_u16(u32::from(cell.circid()) as u16);
        }
        v.write_u8(cell.cmd().into());
        v.write_all(&cell.payload()[..]);
        v
    }

    /// Encode a variable-length cell the way it appeared on the wire,
    /// for the handshake logs.
    fn encode_var_cell_for_log(&self, cell: &VarCell) -> Vec<u8> {
        let mut v = Vec::new();
        if cell.cmd() != ChanCmd::VERSIONS && self.link_proto.get() >= 4 {
            v.write_u32(cell.circid().into());
        } else {
            v.write_u16(u32::from(cell.circid()) as u16);
        }
        v.write_u8(cell.cmd().into());
        v.write_u16(cell.payload().len() as u16);
        v.write_all(cell.payload());
        v
    }

    /// Add a received fixed-length cell to the handshake log.
    pub(super) fn record_rcvd_cell(&self, cell: &Cell) {
        let bytes = self.encode_cell_for_log(cell);
        let _ignore_missing = self.with_hs(|hs| {
            if hs.record_rcvd {
                hs.digest_rcvd.append(&bytes);
            }
        });
    }

    /// Add a received variable-length cell to the handshake log.
    pub(super) fn record_rcvd_var_cell(&self, cell: &VarCell) {
        let bytes = self.encode_var_cell_for_log(cell);
        let _ignore_missing = self.with_hs(|hs| {
            if hs.record_rcvd {
                hs.digest_rcvd.append(&bytes);
            }
        });
    }

    /// Add a sent cell to the handshake log.
    fn record_sent_cell(&self, cell: &Cell) {
        let bytes = self.encode_cell_for_log(cell);
        let _ignore_missing = self.with_hs(|hs| hs.digest_sent.append(&bytes));
    }

    /// Add a sent variable-length cell to the handshake log.
    ///
    /// AUTHENTICATE cells are never part of the log.
    fn record_sent_var_cell(&self, cell: &VarCell) {
        if cell.cmd() == ChanCmd::AUTHENTICATE {
            return;
        }
        let bytes = self.encode_var_cell_for_log(cell);
        let _ignore_missing = self.with_hs(|hs| hs.digest_sent.append(&bytes));
    }

    /// Called when we as a server receive an appropriate cell while
    /// waiting either for a cell or a TLS handshake: move to the v3
    /// link handshake, and add the triggering cell to the handshake
    /// log.
    pub(super) fn enter_v3_handshake_with_cell(&self, cell: &VarCell) -> Result<()> {
        let chan = self.channel()?;
        let started_here = chan.was_started_here();
        if started_here {
            info!(
                "{}: received a cell while TLS-handshaking, not in a link \
                 handshake, on a connection we originated",
                self.unique_id
            );
        }
        debug!("{}: entering v3 link handshake", self.unique_id);
        self.state.set(OrConnState::HandshakingV3);
        self.init_handshake_state(started_here);
        self.record_rcvd_var_cell(cell);
        Ok(())
    }

    /// Send our VERSIONS cell, and note when we did.
    pub(super) fn send_versions_cell(&self) -> Result<()> {
        let versions = Versions::new(LINK_PROTOCOLS)?;
        let cell = versions.into_var_cell();
        self.record_sent_var_cell(&cell);
        self.conn.write_var_cell(&cell)?;
        let now = self.env.clock.now();
        self.with_hs(|hs| hs.sent_versions_at = now)?;
        Ok(())
    }

    /// Send our CERTS cell, with the certificate chain the connection
    /// advertises for us.
    fn send_certs_cell(&self) -> Result<()> {
        let mut certs = Certs::new_empty();
        for (kind, body) in self.conn.own_certs() {
            certs.push_cert_body(kind, body);
        }
        let cell = certs.into_var_cell();
        self.record_sent_var_cell(&cell);
        self.conn.write_var_cell(&cell)
    }

    /// Send an AUTH_CHALLENGE cell with a fresh random challenge.
    fn send_auth_challenge_cell(&self) -> Result<()> {
        let mut challenge = [0_u8; OR_AUTH_CHALLENGE_LEN];
        self.env.rng.fill_bytes(&mut challenge);
        let methods = vec![AuthMethod::RSA_SHA256_TLSSECRET.into()];
        let cell = AuthChallenge::new(challenge, methods).into_var_cell();
        self.record_sent_var_cell(&cell);
        self.conn.write_var_cell(&cell)
    }

    /// Send our NETINFO cell.
    ///
    /// Clients leave the timestamp zero and advertise no addresses;
    /// servers report both.
    fn send_netinfo_cell(&self) -> Result<()> {
        let started_here = self.with_hs(|hs| hs.started_here)?;
        let their_addr = Some(self.conn.peer_addr().ip());
        let netinfo = if started_here && !self.config.public_server {
            Netinfo::for_client(their_addr)
        } else {
            let now = self.env.clock.now() as u32;
            Netinfo::for_relay(now, their_addr, self.conn.local_addrs())
        };
        let cell = netinfo.into_fixed_cell()?;
        self.record_sent_cell(&cell);
        self.conn.write_cell(&cell)
    }

    /// Send an AUTHENTICATE cell, proving our identity with the
    /// RSA_SHA256_TLSSECRET method.
    fn send_authenticate_cell(&self) -> Result<()> {
        // We originated this connection, so our log is the client log.
        let (client_log, server_log) =
            self.with_hs(|hs| (hs.digest_sent.finalize(), hs.digest_rcvd.finalize()))?;
        let mut body = self.conn.compute_authenticator(&client_log, &server_log)?;
        if body.len() != V3_AUTH_BODY_LEN {
            return Err(Error::Internal(
                "lower layer computed a mis-sized authenticator".into(),
            ));
        }
        let signature = self.env.signer.sign_sha256(&body)?;
        body.extend_from_slice(&signature);
        let cell = Authenticate::new(AuthMethod::RSA_SHA256_TLSSECRET, body).into_var_cell();
        // Deliberately not recorded: AUTHENTICATE is outside the log.
        self.conn.write_var_cell(&cell)
    }

    /// Send a handshake cell, closing the connection on failure.
    fn send_or_close(&self, what: &'static str, r: Result<()>) -> Result<()> {
        match r {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("{}: couldn't send {} cell: {}", self.unique_id, what, e);
                self.error_close();
                Err(Error::SendFailed(what))
            }
        }
    }

    /// Process a VERSIONS cell.
    ///
    /// The link protocol must still be unset.  We pick the highest
    /// version both sides support and continue the negotiation from
    /// there.
    pub(super) fn process_versions_cell(&self, cell: &VarCell) -> Result<()> {
        if self.link_proto.get() != 0 || self.with_hs(|hs| hs.received_versions)? {
            info!(
                "{}: received a VERSIONS cell on a connection with its version \
                 already set to {}; dropping",
                self.unique_id,
                self.link_proto.get()
            );
            return Ok(());
        }
        match self.state.get() {
            OrConnState::HandshakingV2 | OrConnState::HandshakingV3 => {}
            _ => {
                info!(
                    "{}: VERSIONS cell while in unexpected state",
                    self.unique_id
                );
                return Ok(());
            }
        }

        let versions = match Versions::decode(cell.payload()) {
            Ok(v) => v,
            Err(_) => {
                return Err(self.proto_violation("Couldn't parse VERSIONS cell".into()));
            }
        };
        let link_proto = match versions.best_shared_link_protocol(LINK_PROTOCOLS) {
            None => {
                return Err(self.proto_violation(
                    "Couldn't find a version in common between my version list \
                     and the list in the VERSIONS cell"
                        .into(),
                ));
            }
            Some(1) => {
                // Negotiating version 1 makes no sense, since version
                // 1 has no VERSIONS cells.
                return Err(self.proto_violation(
                    "Used version negotiation protocol to negotiate a v1 \
                     connection"
                        .into(),
                ));
            }
            Some(v) if v < 3 && self.state.get() == OrConnState::HandshakingV3 => {
                return Err(self.proto_violation(
                    "Negotiated link protocol 2 or lower after doing a v3 TLS \
                     handshake"
                        .into(),
                ));
            }
            Some(v) => v,
        };

        self.link_proto.set(link_proto);
        let started_here = self.with_hs(|hs| {
            hs.received_versions = true;
            hs.started_here
        })?;

        if link_proto == 2 {
            info!(
                "{}: negotiated version 2 with {}; sending NETINFO",
                self.unique_id,
                self.conn.peer_addr()
            );
            self.send_or_close("netinfo", self.send_netinfo_cell())?;
        } else {
            let send_versions = !started_here;
            // If we want to authenticate, send a CERTS cell.
            let send_certs = !started_here || self.config.public_server;
            // If we're a relay that got a connection, ask for
            // authentication.
            let send_chall = !started_here && self.config.public_server;
            // If our certs cell will authenticate us, we can send a
            // netinfo cell right now.
            let send_netinfo = !started_here;

            info!(
                "{}: negotiated version {} with {}",
                self.unique_id,
                link_proto,
                self.conn.peer_addr()
            );

            if send_versions {
                self.send_or_close("versions", self.send_versions_cell())?;
            }
            if send_certs {
                self.send_or_close("certs", self.send_certs_cell())?;
            }
            if send_chall {
                self.send_or_close("auth_challenge", self.send_auth_challenge_cell())?;
            }
            if send_netinfo {
                self.send_or_close("netinfo", self.send_netinfo_cell())?;
            }
        }
        Ok(())
    }

    /// Process a CERTS cell.
    ///
    /// On the initiator side a good cell authenticates the responder;
    /// on the responder side the certificates are retained so a later
    /// AUTHENTICATE cell can be checked.
    pub(super) fn process_certs_cell(&self, cell: &VarCell) -> Result<()> {
        const KIND: &str = "CERTS";
        self.check_cell(
            self.state.get() == OrConnState::HandshakingV3,
            KIND,
            "We're not doing a v3 handshake!",
        )?;
        self.check_cell(
            self.link_proto.get() >= 3,
            KIND,
            "We're not using link protocol >= 3",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.received_certs_cell)?,
            KIND,
            "We already got one",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.authenticated)?,
            KIND,
            "We're already authenticated!",
        )?;
        self.check_cell(!cell.payload().is_empty(), KIND, "It had no body")?;
        self.check_cell(
            cell.circid().is_zero(),
            KIND,
            "It had a nonzero circuit ID",
        )?;

        let certs = match Certs::decode(cell.payload()) {
            Ok(c) => c,
            Err(_) => {
                return Err(self.bad_cell(KIND, "It ends in the middle of a certificate"));
            }
        };

        let mut link_cert: Option<Rc<dyn PeerCert>> = None;
        let mut id_cert: Option<Rc<dyn PeerCert>> = None;
        let mut auth_cert: Option<Rc<dyn PeerCert>> = None;
        for (kind, body) in certs.iter() {
            match kind {
                CertKind::TLS_LINK | CertKind::ID_1024 | CertKind::AUTH_1024 => {
                    let cert = match self.env.certs.decode(body) {
                        Some(c) => c,
                        None => {
                            info!(
                                "{}: received undecodable certificate in CERTS \
                                 cell from {}",
                                self.unique_id,
                                self.conn.peer_addr()
                            );
                            continue;
                        }
                    };
                    let slot = match kind {
                        CertKind::TLS_LINK => &mut link_cert,
                        CertKind::ID_1024 => &mut id_cert,
                        _ => &mut auth_cert,
                    };
                    if slot.is_some() {
                        let why = match kind {
                            CertKind::TLS_LINK => "Too many TLS_LINK certificates",
                            CertKind::ID_1024 => "Too many ID_1024 certificates",
                            _ => "Too many AUTH_1024 certificates",
                        };
                        return Err(self.bad_cell(KIND, why));
                    }
                    *slot = Some(cert);
                }
                _ => {
                    // Unknown types are decoded and discarded.
                    let _discarded = self.env.certs.decode(body);
                }
            }
        }

        let started_here = self.with_hs(|hs| hs.started_here)?;
        let mut send_netinfo = false;
        if started_here {
            let (id_c, link_c) = match (&id_cert, &link_cert) {
                (Some(i), Some(l)) => (Rc::clone(i), Rc::clone(l)),
                _ => return Err(self.bad_cell(KIND, "The certs we wanted were missing")),
            };
            // Okay. We should be able to check the certificates now.
            if !self.conn.tls_cert_matches_key(&*link_c) {
                return Err(
                    self.bad_cell(KIND, "The link certificate didn't match the TLS public key")
                );
            }
            if !self.env.certs.is_valid(&*link_c, &*id_c) {
                return Err(self.bad_cell(KIND, "The link certificate was not valid"));
            }
            if !self.env.certs.is_valid(&*id_c, &*id_c) {
                return Err(self.bad_cell(KIND, "The ID certificate was not valid"));
            }

            let peer_id = id_c.key_digest();
            let chan = self.channel()?;
            let expected = chan.identity_digest();
            if expected != [0_u8; 20] && expected != peer_id {
                return Err(self.bad_cell(KIND, "Peer identity was not as expected"));
            }

            self.with_hs(|hs| {
                hs.authenticated = true;
                hs.authenticated_peer_id = peer_id;
                hs.id_cert = Some(Rc::clone(&id_c));
                hs.link_cert = Some(Rc::clone(&link_c));
            })?;
            chan.set_remote_end(Some(&peer_id), None);
            let range = self.conn.set_circ_id_type(Some(&*id_c));
            chan.set_circ_id_range(range);
            self.conn.init_peer_identity(Some(&peer_id));

            info!(
                "{}: got some good certificates from {}: authenticated it",
                self.unique_id,
                self.conn.peer_addr()
            );

            if !self.config.public_server {
                // If we initiated the connection and we are not a
                // public server, we aren't planning to authenticate at
                // all.  At this point we know who we are talking to,
                // so we can just send a netinfo now.
                send_netinfo = true;
            }
        } else {
            let (id_c, auth_c) = match (&id_cert, &auth_cert) {
                (Some(i), Some(a)) => (Rc::clone(i), Rc::clone(a)),
                _ => return Err(self.bad_cell(KIND, "The certs we wanted were missing")),
            };
            // Remember these certificates so we can check an
            // AUTHENTICATE cell.
            if !self.env.certs.is_valid(&*auth_c, &*id_c) {
                return Err(self.bad_cell(KIND, "The authentication certificate was not valid"));
            }
            if !self.env.certs.is_valid(&*id_c, &*id_c) {
                return Err(self.bad_cell(KIND, "The ID certificate was not valid"));
            }
            info!(
                "{}: got some good certificates from {}: waiting for \
                 AUTHENTICATE",
                self.unique_id,
                self.conn.peer_addr()
            );
            self.with_hs(|hs| {
                hs.id_cert = Some(id_c);
                hs.auth_cert = Some(auth_c);
            })?;
        }

        self.with_hs(|hs| hs.received_certs_cell = true)?;

        if send_netinfo {
            self.send_or_close("netinfo", self.send_netinfo_cell())?;
        }
        Ok(())
    }

    /// Process an AUTH_CHALLENGE cell.
    ///
    /// Public servers that initiated the connection answer with an
    /// AUTHENTICATE cell and then a NETINFO cell; anyone else has
    /// already sent their NETINFO and just notes the challenge.
    pub(super) fn process_auth_challenge_cell(&self, cell: &VarCell) -> Result<()> {
        const KIND: &str = "AUTH_CHALLENGE";
        self.check_cell(
            self.state.get() == OrConnState::HandshakingV3,
            KIND,
            "We're not currently doing a v3 handshake",
        )?;
        self.check_cell(
            self.link_proto.get() >= 3,
            KIND,
            "We're not using link protocol >= 3",
        )?;
        self.check_cell(
            self.with_hs(|hs| hs.started_here)?,
            KIND,
            "We didn't originate this connection",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.received_auth_challenge)?,
            KIND,
            "We already received one",
        )?;
        self.check_cell(
            self.with_hs(|hs| hs.received_certs_cell)?,
            KIND,
            "We haven't gotten a CERTS cell yet",
        )?;
        self.check_cell(
            cell.payload().len() >= OR_AUTH_CHALLENGE_LEN + 2,
            KIND,
            "It was too short",
        )?;
        self.check_cell(
            cell.circid().is_zero(),
            KIND,
            "It had a nonzero circuit ID",
        )?;

        let challenge = match AuthChallenge::decode(cell.payload()) {
            Ok(c) => c,
            Err(_) => return Err(self.bad_cell(KIND, "It looks truncated")),
        };
        let use_rsa = challenge.offers(AuthMethod::RSA_SHA256_TLSSECRET);

        self.with_hs(|hs| hs.received_auth_challenge = true)?;

        if !self.config.public_server {
            // We don't want to authenticate on a connection we
            // originated, and we already sent a NETINFO cell when we
            // got the CERTS cell.  Nothing more to do.
            return Ok(());
        }

        if use_rsa {
            info!(
                "{}: got an AUTH_CHALLENGE cell from {}: sending authentication",
                self.unique_id,
                self.conn.peer_addr()
            );
            self.send_or_close("authenticate", self.send_authenticate_cell())?;
        } else {
            info!(
                "{}: got an AUTH_CHALLENGE cell from {}, but we don't know any \
                 of its authentication types; not authenticating",
                self.unique_id,
                self.conn.peer_addr()
            );
        }

        self.send_or_close("netinfo", self.send_netinfo_cell())?;
        Ok(())
    }

    /// Process an AUTHENTICATE cell.
    ///
    /// A good cell proves that the peer that initiated this connection
    /// controls the identity its CERTS cell advertised.
    pub(super) fn process_authenticate_cell(&self, cell: &VarCell) -> Result<()> {
        const KIND: &str = "AUTHENTICATE";
        self.check_cell(
            self.state.get() == OrConnState::HandshakingV3,
            KIND,
            "We're not doing a v3 handshake",
        )?;
        self.check_cell(
            self.link_proto.get() >= 3,
            KIND,
            "We're not using link protocol >= 3",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.started_here)?,
            KIND,
            "We originated this connection",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.received_authenticate)?,
            KIND,
            "We already got one!",
        )?;
        self.check_cell(
            !self.with_hs(|hs| hs.authenticated)?,
            KIND,
            "The peer is already authenticated",
        )?;
        self.check_cell(
            self.with_hs(|hs| hs.received_certs_cell)?,
            KIND,
            "We never got a certs cell",
        )?;
        let auth_cert = self.with_hs(|hs| hs.auth_cert.clone())?;
        let id_cert = self.with_hs(|hs| hs.id_cert.clone())?;
        let auth_cert = match auth_cert {
            Some(c) => c,
            None => {
                return Err(self.bad_cell(KIND, "We never got an authentication certificate"));
            }
        };
        let id_cert = match id_cert {
            Some(c) => c,
            None => return Err(self.bad_cell(KIND, "We never got an identity certificate")),
        };
        self.check_cell(cell.payload().len() >= 4, KIND, "Cell was way too short")?;

        let msg = match Authenticate::decode(cell.payload()) {
            Ok(m) => m,
            Err(_) => return Err(self.bad_cell(KIND, "Authenticator was truncated")),
        };
        if msg.authtype() != AuthMethod::RSA_SHA256_TLSSECRET {
            return Err(self.bad_cell(KIND, "Authenticator type was not recognized"));
        }
        let auth = msg.body();
        if auth.len() < V3_AUTH_BODY_LEN + 1 {
            return Err(self.bad_cell(KIND, "Authenticator was too short"));
        }

        // We are the responder here, so the peer's log is the one we
        // received.
        let (sent_log, rcvd_log) =
            self.with_hs(|hs| (hs.digest_sent.finalize(), hs.digest_rcvd.finalize()))?;
        let expected = match self.conn.compute_authenticator(&rcvd_log, &sent_log) {
            Ok(e) => e,
            Err(_) => {
                return Err(self.bad_cell(KIND, "Couldn't compute expected AUTHENTICATE cell body"));
            }
        };
        if expected.len() < V3_AUTH_FIXED_PART_LEN
            || expected[..V3_AUTH_FIXED_PART_LEN] != auth[..V3_AUTH_FIXED_PART_LEN]
        {
            return Err(self.bad_cell(
                KIND,
                "Some field in the AUTHENTICATE cell body was not as expected",
            ));
        }

        if !self.env.signer.verify_sha256(
            &*auth_cert,
            &auth[..V3_AUTH_BODY_LEN],
            &auth[V3_AUTH_BODY_LEN..],
        ) {
            return Err(self.bad_cell(KIND, "Signature wasn't valid"));
        }

        // Okay, we are authenticated.
        let peer_id = id_cert.key_digest();
        self.with_hs(|hs| {
            hs.received_authenticate = true;
            hs.authenticated = true;
            hs.authenticated_peer_id = peer_id;
            hs.record_rcvd = false;
        })?;

        let chan = self.channel()?;
        chan.set_remote_end(Some(&peer_id), None);
        let range = self.conn.set_circ_id_type(Some(&*id_cert));
        chan.set_circ_id_range(range);
        self.conn.init_peer_identity(Some(&peer_id));

        info!(
            "{}: got an AUTHENTICATE cell from {}: looks good",
            self.unique_id,
            self.conn.peer_addr()
        );
        Ok(())
    }

    /// Process a NETINFO cell: read and act on its contents, and mark
    /// the connection open.
    pub(super) fn process_netinfo_cell(&self, cell: &Cell) -> Result<()> {
        const KIND: &str = "NETINFO";
        let link_proto = self.link_proto.get();
        if link_proto < 2 {
            info!(
                "{}: received a NETINFO cell on {} connection; dropping",
                self.unique_id,
                if link_proto == 0 {
                    "a non-versioned"
                } else {
                    "a v1"
                }
            );
            return Ok(());
        }
        match self.state.get() {
            OrConnState::HandshakingV2 | OrConnState::HandshakingV3 => {}
            _ => {
                info!(
                    "{}: received a NETINFO cell on a non-handshaking \
                     connection; dropping",
                    self.unique_id
                );
                return Ok(());
            }
        }
        self.check_cell(
            self.with_hs(|hs| hs.received_versions)?,
            KIND,
            "We never got a VERSIONS cell",
        )?;

        if self.state.get() == OrConnState::HandshakingV3 {
            let (started_here, authenticated) =
                self.with_hs(|hs| (hs.started_here, hs.authenticated))?;
            if started_here {
                self.check_cell(
                    authenticated,
                    KIND,
                    "Got a NETINFO cell from server, but no authentication",
                )?;
            } else if !authenticated {
                // We're the server.  If the client never authenticated,
                // we have some housekeeping to do: it gets no identity
                // and the default circuit-ID parity.
                debug_assert!(
                    self.with_hs(|hs| hs.authenticated_peer_id == [0_u8; 20])
                        .unwrap_or(true)
                );
                let range = self.conn.set_circ_id_type(None);
                self.channel()?.set_circ_id_range(range);
                self.conn.init_peer_identity(None);
            }
        }

        // Decode the cell.
        let netinfo = match Netinfo::decode(cell.payload()) {
            Ok(n) => n,
            Err(_) => return Err(self.bad_cell(KIND, "Addresses too long in netinfo cell")),
        };

        let now = self.env.clock.now();
        let sent_versions_at = self.with_hs(|hs| hs.sent_versions_at)?;
        let mut apparent_skew: i64 = 0;
        if sent_versions_at != 0 && (now as i64 - sent_versions_at as i64).abs() < NETINFO_TIMEOUT
        {
            apparent_skew = now as i64 - i64::from(netinfo.timestamp());
        }
        let my_apparent_addr = netinfo.their_addr().copied();

        // Consider the other addresses; if any matches the address we
        // dialed, this connection is "canonical".
        let real_addr = self.conn.real_addr();
        if netinfo.my_addrs().iter().any(|a| *a == real_addr) {
            self.conn.set_canonical(true);
        }

        // Act on apparent skew.
        let chan = self.channel()?;
        let id = chan.identity_digest();
        if apparent_skew.abs() > NETINFO_NOTICE_SKEW && self.env.routers.is_known_router(&id) {
            let peer = self.conn.peer_addr();
            let (ours, theirs) = if apparent_skew > 0 {
                ("ahead", "behind")
            } else {
                ("behind", "ahead")
            };
            let seconds = apparent_skew.abs();
            if self.env.routers.is_trusted_dir(&id) {
                warn!(
                    "{}: received NETINFO cell with skewed time from server at \
                     {}. It seems that our clock is {} by {} seconds, or that \
                     theirs is {}. An accurate clock is required: please check \
                     your time and date settings.",
                    self.unique_id, peer, ours, seconds, theirs
                );
                // Only tell the controller about an authority's view.
                self.env.control.note_clock_skew(apparent_skew, &peer);
            } else {
                info!(
                    "{}: received NETINFO cell with skewed time from server at \
                     {}. It seems that our clock is {} by {} seconds, or that \
                     theirs is {}.",
                    self.unique_id, peer, ours, seconds, theirs
                );
            }
        }

        // The handshake is done: mark the connection open, which
        // drives the channel to Open.
        self.state.set(OrConnState::Open);
        self.conn_state_changed()?;

        info!(
            "{}: got good NETINFO cell from {}; OR connection is now open, \
             using protocol version {}. Our address is apparently {}",
            self.unique_id,
            self.conn.peer_addr(),
            link_proto,
            my_apparent_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<none>".into())
        );
        Ok(())
    }
}
