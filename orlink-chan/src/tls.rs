//! A concrete channel implementation over an OR TLS connection.
//!
//! The [`TlsChannel`] binds a [`Channel`] to a lower-layer TLS
//! connection (seen through the [`TlsLink`] trait), translates
//! connection state changes into channel state changes, and runs the
//! link handshake: until the handshake finishes, every cell that
//! arrives from the wire is consumed here, and only afterwards do
//! cells flow up to the handlers installed on the channel.

mod handshake;

use crate::channel::{Channel, ChannelState, Transport, UniqId, WeakChannel};
use crate::external::{LinkEnv, TlsConnector, TlsLink};
use crate::{Error, Result};
use orlink_cell::chancell::{Cell, ChanCmd, VarCell};

use std::cell::{Cell as StdCell, RefCell};
use std::net::IpAddr;
use std::rc::Rc;

use tracing::{debug, info, warn};

/// Static configuration for the link layer.
#[derive(Clone, Debug, Default)]
pub struct LinkConfig {
    /// True if we are a public server: a relay that advertises itself
    /// and authenticates on the links it originates.
    pub public_server: bool,
}

/// Sub-state of the OR connection that backs a TLS channel.
///
/// This is not the channel state: a channel stays in Opening for the
/// whole handshake, while the connection below it walks through these.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum OrConnState {
    /// The TLS handshake itself is still in progress.
    TlsHandshaking,
    /// Server side: the initiator started a second, v2-style TLS
    /// renegotiation.
    TlsServerRenegotiating,
    /// Negotiating the link with a v2 handshake.
    HandshakingV2,
    /// Negotiating the link with a v3 handshake.
    HandshakingV3,
    /// The link handshake is complete.
    Open,
}

/// A channel transport bound to an OR TLS connection.
pub struct TlsChannel {
    /// The channel this transport serves.  Weak: the registry and the
    /// callers keep the channel alive, not us.
    chan: WeakChannel,
    /// The lower-layer connection.
    conn: Rc<dyn TlsLink>,
    /// Current sub-state of the connection.
    state: StdCell<OrConnState>,
    /// The negotiated link protocol; 0 until VERSIONS negotiation
    /// completes.
    link_proto: StdCell<u16>,
    /// Link-handshake state; None until a handshake begins.
    hs: RefCell<Option<handshake::HandshakeState>>,
    /// Static configuration.
    config: LinkConfig,
    /// Collaborator handles.
    env: Rc<LinkEnv>,
    /// Copy of the channel's identifier, for logging.
    unique_id: UniqId,
}

impl TlsChannel {
    /// Launch a new locally-initiated channel to `addr`:`port`,
    /// expecting the identity `id_digest`.
    ///
    /// The channel is created in the Opening state with this transport
    /// installed.  If the lower layer cannot start a connection, the
    /// channel moves to Error and the lower-layer error is returned.
    pub fn connect(
        env: Rc<LinkEnv>,
        config: LinkConfig,
        connector: &dyn TlsConnector,
        addr: IpAddr,
        port: u16,
        id_digest: &[u8; 20],
    ) -> Result<(Channel, Rc<TlsChannel>)> {
        let chan = Channel::new(Rc::clone(&env));
        chan.set_remote_end(Some(id_digest), None);
        chan.change_state(ChannelState::Opening)?;
        match connector.connect(addr, port, id_digest) {
            Ok(conn) => {
                let tls = Rc::new(TlsChannel {
                    chan: chan.downgrade(),
                    conn,
                    state: StdCell::new(OrConnState::TlsHandshaking),
                    link_proto: StdCell::new(0),
                    hs: RefCell::new(None),
                    config,
                    env,
                    unique_id: chan.unique_id(),
                });
                let transport: Rc<dyn Transport> = Rc::clone(&tls) as Rc<dyn Transport>;
                chan.set_transport(Some(transport));
                Ok((chan, tls))
            }
            Err(e) => {
                debug!("{}: lower layer failed to connect: {}", chan.unique_id(), e);
                chan.close_for_error()?;
                chan.closed()?;
                Err(e)
            }
        }
    }

    /// Wrap an accepted lower-layer connection as a remotely-initiated
    /// channel.
    ///
    /// The caller should hand the resulting channel to a listening
    /// channel with [`Channel::queue_incoming`].
    pub fn accept(
        env: Rc<LinkEnv>,
        config: LinkConfig,
        conn: Rc<dyn TlsLink>,
    ) -> Result<(Channel, Rc<TlsChannel>)> {
        let chan = Channel::new(Rc::clone(&env));
        chan.set_initiated_remotely();
        chan.change_state(ChannelState::Opening)?;
        let tls = Rc::new(TlsChannel {
            chan: chan.downgrade(),
            conn,
            state: StdCell::new(OrConnState::TlsHandshaking),
            link_proto: StdCell::new(0),
            hs: RefCell::new(None),
            config,
            env,
            unique_id: chan.unique_id(),
        });
        let transport: Rc<dyn Transport> = Rc::clone(&tls) as Rc<dyn Transport>;
        chan.set_transport(Some(transport));
        Ok((chan, tls))
    }

    /// Return a usable handle to the channel this transport serves.
    fn channel(&self) -> Result<Channel> {
        self.chan
            .upgrade()
            .ok_or_else(|| Error::Internal("TLS connection outlived its channel".into()))
    }

    /// Return the negotiated link protocol, or 0.
    pub fn link_proto(&self) -> u16 {
        self.link_proto.get()
    }

    /// Return the current connection sub-state.
    pub(crate) fn conn_state(&self) -> OrConnState {
        self.state.get()
    }

    /// Begin the link handshake on a locally-initiated connection,
    /// after the lower layer reports that its TLS handshake finished.
    ///
    /// Sends our VERSIONS cell.
    pub fn start_client_handshake(&self) -> Result<()> {
        let chan = self.channel()?;
        if !chan.was_started_here() {
            return Err(Error::Internal(
                "tried to start a client handshake on an accepted connection".into(),
            ));
        }
        if self.state.get() != OrConnState::TlsHandshaking {
            return Err(Error::Internal(
                "tried to start a client handshake twice".into(),
            ));
        }
        debug!("{}: starting v3 link handshake", self.unique_id);
        self.state.set(OrConnState::HandshakingV3);
        self.init_handshake_state(true);
        if let Err(e) = self.send_versions_cell() {
            warn!("{}: couldn't send versions cell: {}", self.unique_id, e);
            self.error_close();
            return Err(e);
        }
        Ok(())
    }

    /// Note that the lower layer has fallen back to a v2-style link
    /// handshake (a server-side TLS renegotiation).
    pub fn enter_v2_handshake(&self) -> Result<()> {
        match self.state.get() {
            OrConnState::TlsHandshaking | OrConnState::TlsServerRenegotiating => {}
            _ => {
                return Err(Error::Internal(
                    "v2 handshake started from an unexpected state".into(),
                ));
            }
        }
        let chan = self.channel()?;
        self.state.set(OrConnState::HandshakingV2);
        self.init_handshake_state(chan.was_started_here());
        Ok(())
    }

    /// Note a state change reported by the lower-layer connection.
    ///
    /// Entering the connection's "open" state drives the channel to
    /// Open; leaving it while the channel is Open parks the channel in
    /// Maint.
    pub fn handle_state_change(&self, conn_now_open: bool) -> Result<()> {
        if conn_now_open {
            self.state.set(OrConnState::Open);
        } else if self.state.get() == OrConnState::Open {
            self.state.set(OrConnState::TlsServerRenegotiating);
        }
        self.conn_state_changed()
    }

    /// Note that the lower layer has finished tearing the connection
    /// down; completes a Closing channel.
    pub fn finished_closing(&self) -> Result<()> {
        let chan = self.channel()?;
        chan.closed()
    }

    /// Propagate our connection sub-state into the channel state
    /// machine.
    fn conn_state_changed(&self) -> Result<()> {
        let chan = self.channel()?;
        if self.state.get() == OrConnState::Open {
            // We can go to Open from Opening or Maint on this.
            chan.change_state(ChannelState::Open)?;
        } else if chan.state() == ChannelState::Open {
            // Not open, so from Open we go to Maint; otherwise no
            // change.
            chan.change_state(ChannelState::Maint)?;
        }
        Ok(())
    }

    /// Handle a fixed-length cell that arrived from the lower layer.
    ///
    /// Before the handshake finishes, only VERSIONS and NETINFO are
    /// tolerated here; afterwards, circuit-bearing cells are queued
    /// onto the channel for the handlers above.
    pub fn handle_cell(&self, cell: Cell) -> Result<()> {
        if self.conn.is_marked_for_close() {
            return Ok(());
        }
        let handshaking = self.state.get() != OrConnState::Open;
        let cmd = cell.cmd();

        // Reject all but VERSIONS and NETINFO when handshaking.
        // (VERSIONS should actually be impossible; it's
        // variable-length.)
        if handshaking && cmd != ChanCmd::VERSIONS && cmd != ChanCmd::NETINFO {
            return Err(self.proto_violation(format!(
                "Received unexpected cell command {} during handshake",
                cmd
            )));
        }
        if self.state.get() == OrConnState::HandshakingV3 {
            self.record_rcvd_cell(&cell);
        }

        match cmd {
            ChanCmd::PADDING => {}
            ChanCmd::VERSIONS => {
                // A fixed-length VERSIONS cell can't be real.
                debug!("{}: dropping fixed-length VERSIONS cell", self.unique_id);
            }
            ChanCmd::NETINFO => self.process_netinfo_cell(&cell)?,
            ChanCmd::CREATE
            | ChanCmd::CREATED
            | ChanCmd::CREATE_FAST
            | ChanCmd::CREATED_FAST
            | ChanCmd::RELAY
            | ChanCmd::RELAY_EARLY
            | ChanCmd::DESTROY => {
                // These are all transport independent; pass them up
                // through the channel mechanism.
                let chan = self.channel()?;
                chan.queue_cell(cell)?;
            }
            _ => {
                info!(
                    "{}: cell of unknown type ({}) received; dropping",
                    self.unique_id, cmd
                );
            }
        }
        Ok(())
    }

    /// Handle a variable-length cell that arrived from the lower
    /// layer.
    ///
    /// All the variable-length commands are handshake-related and are
    /// consumed below the channel's handler mechanism.
    pub fn handle_var_cell(&self, cell: VarCell) -> Result<()> {
        if self.conn.is_marked_for_close() {
            return Ok(());
        }
        let cmd = cell.cmd();
        match self.state.get() {
            OrConnState::HandshakingV2 => {
                if cmd != ChanCmd::VERSIONS {
                    return Err(self.proto_violation(format!(
                        "Received a cell with command {} in a v2 handshake",
                        cmd
                    )));
                }
            }
            OrConnState::TlsHandshaking | OrConnState::TlsServerRenegotiating => {
                // It's possible to notice "data arrived" before "the
                // TLS handshake finished", and a cell here is also how
                // a v3 handshake begins.
                if !command_allowed_before_handshake(cmd) {
                    return Err(self.proto_violation(format!(
                        "Received a cell with command {} while TLS-handshaking",
                        cmd
                    )));
                }
                self.enter_v3_handshake_with_cell(&cell)?;
            }
            OrConnState::HandshakingV3 => {
                if cmd != ChanCmd::AUTHENTICATE {
                    self.record_rcvd_var_cell(&cell);
                }
            }
            OrConnState::Open => {
                if self.link_proto.get() < 3 {
                    info!(
                        "{}: variable-length cell with command {} on an open \
                         connection with link protocol {}; ignoring it",
                        self.unique_id,
                        cmd,
                        self.link_proto.get()
                    );
                    return Ok(());
                }
            }
        }

        match cmd {
            ChanCmd::VERSIONS => self.process_versions_cell(&cell)?,
            ChanCmd::VPADDING => {}
            ChanCmd::CERTS => self.process_certs_cell(&cell)?,
            ChanCmd::AUTH_CHALLENGE => self.process_auth_challenge_cell(&cell)?,
            ChanCmd::AUTHENTICATE => self.process_authenticate_cell(&cell)?,
            ChanCmd::AUTHORIZE => {
                // Ignored so far.
            }
            _ => {
                info!(
                    "{}: variable-length cell of unknown type ({}) received; \
                     dropping",
                    self.unique_id, cmd
                );
            }
        }
        Ok(())
    }

    /// Log a protocol violation, mark the connection for close, and
    /// move the channel to Error.  Returns the error for the caller to
    /// propagate.
    fn proto_violation(&self, why: String) -> Error {
        info!(
            "{}: {} from {}; closing the connection",
            self.unique_id,
            why,
            self.conn.peer_addr()
        );
        self.error_close();
        Error::ChanProto(why)
    }

    /// Like [`TlsChannel::proto_violation`], with the message framing
    /// used for malformed handshake cells.
    fn bad_cell(&self, cell_kind: &str, why: &str) -> Error {
        info!(
            "{}: Received a bad {} cell from {}: {}",
            self.unique_id,
            cell_kind,
            self.conn.peer_addr(),
            why
        );
        self.error_close();
        Error::ChanProto(why.to_string())
    }

    /// Mark the connection for close and bring the channel to rest in
    /// Error.
    fn error_close(&self) {
        self.conn.mark_for_close();
        if let Some(chan) = self.chan.upgrade() {
            if let Err(e) = chan.close_for_error() {
                debug!("{}: {}", self.unique_id, e);
            }
            if let Err(e) = chan.closed() {
                debug!("{}: {}", self.unique_id, e);
            }
        }
    }
}

/// Return true if `cmd` is a cell command that's allowed to start a
/// v3 handshake.
fn command_allowed_before_handshake(cmd: ChanCmd) -> bool {
    matches!(
        cmd,
        ChanCmd::VERSIONS | ChanCmd::VPADDING | ChanCmd::AUTHORIZE
    )
}

impl Transport for TlsChannel {
    fn close(&self, _chan: &Channel) {
        // Ask the event loop to flush and tear down the connection;
        // it reports back through finished_closing().
        self.conn.mark_for_close();
    }

    fn write_cell(&self, _chan: &Channel, cell: Cell) {
        if let Err(e) = self.conn.write_cell(&cell) {
            warn!("{}: lower layer rejected a cell: {}", self.unique_id, e);
            self.error_close();
        }
    }

    fn write_var_cell(&self, _chan: &Channel, cell: VarCell) {
        if let Err(e) = self.conn.write_var_cell(&cell) {
            warn!("{}: lower layer rejected a cell: {}", self.unique_id, e);
            self.error_close();
        }
    }
}
