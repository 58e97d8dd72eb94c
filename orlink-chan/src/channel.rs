//! The channel abstraction: a point-to-point, authenticated carrier
//! of cells between two onion routers, or between a client and a
//! router.
//!
//! # Overview
//!
//! A [`Channel`] sits between the circuit layer above it and a
//! transport below it.  Inbound cells arrive from the transport via
//! [`Channel::queue_cell`] and [`Channel::queue_var_cell`] and are
//! dispatched to handler callbacks owned by the circuit layer;
//! outbound cells are submitted with [`Channel::write_cell`] and
//! either go straight to the transport or wait in a queue until the
//! channel is open.  A [`registry::ChannelRegistry`] keeps the
//! process-wide indices of channels by state class.
//!
//! Everything here is single-threaded: callbacks run synchronously on
//! the caller's stack, and reentrancy (a handler closing the channel
//! it was called from, say) is made safe by the cheap clonability of
//! the `Channel` handle.  Every callback invocation holds a clone of
//! the handle for the duration of the call, so the object it was
//! called on cannot disappear mid-call.

pub mod pqueue;
pub mod registry;
mod state;
mod unique_id;

pub use state::{ChannelState, CloseReason};
pub use unique_id::UniqId;

use crate::external::LinkEnv;
use crate::{Error, Result};
use orlink_cell::chancell::msg::DestroyReason;
use orlink_cell::chancell::{AnyCell, Cell, ChanCmd, CircId, VarCell};

use std::cell::{Cell as StdCell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use tracing::{debug, info, trace};

/// A callback that receives inbound fixed-length cells.
pub type CellHandler = Rc<dyn Fn(&Channel, Cell)>;
/// A callback that receives inbound variable-length cells.
pub type VarCellHandler = Rc<dyn Fn(&Channel, VarCell)>;
/// A callback that receives child channels accepted by a listener.
pub type ListenerFn = Rc<dyn Fn(&Channel, Channel)>;

/// Which half of the circuit-ID space we are allowed to allocate in
/// on a channel.
///
/// If we're a client, we can allocate any nonzero circuit ID we want.
/// Once the link is authenticated, the side whose identity key is
/// higher allocates High circuit IDs and the other side allocates Low
/// ones, so the two endpoints never collide on new-circuit
/// allocation.  The comparison of identity keys happens below us, in
/// [`crate::external::TlsLink::set_circ_id_type`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircIdRange {
    /// Allocate from the lower half of the space.
    Low,
    /// Allocate from the upper half of the space.
    High,
    /// Allocate from the whole space.
    All,
}

impl CircIdRange {
    /// Force the high bit of a 15-bit seed value into this range.
    fn apply(self, id: u16) -> u16 {
        match self {
            CircIdRange::Low => id & 0x7fff,
            CircIdRange::High => id | 0x8000,
            CircIdRange::All => id,
        }
    }
}

/// The transport methods that a concrete channel implementation slots
/// into the channel base.
///
/// The `chan` argument is always the channel the transport is bound
/// to; the base passes it so that implementations need not keep their
/// own strong back-reference.
pub trait Transport {
    /// Begin shutting down the lower layer, in response to a local
    /// close request.
    ///
    /// The transport must eventually drive the channel from Closing to
    /// Closed or Error by arranging a call to [`Channel::closed`].
    fn close(&self, chan: &Channel);
    /// Transmit a fixed-length cell.
    fn write_cell(&self, chan: &Channel, cell: Cell);
    /// Transmit a variable-length cell.
    fn write_var_cell(&self, chan: &Channel, cell: VarCell);
}

/// The number of bytes in a channel's remote identity digest.
const ID_LEN: usize = 20;

/// The shared core of a channel.
///
/// Kept behind `Rc`: the registry holds the one long-lived strong
/// handle, the transport keeps only a weak one, and callers clone the
/// handle for the duration of each call into the channel.
struct ChannelCore {
    /// Process-unique identifier for this channel.
    unique_id: UniqId,
    /// Current state; see [`ChannelState`].
    state: StdCell<ChannelState>,
    /// Why this channel is closing (or closed).  Must be set before
    /// the channel may enter Closing, Closed, or Error.
    reason_for_closing: StdCell<CloseReason>,
    /// True while this channel is in a [`registry::ChannelRegistry`].
    registered: StdCell<bool>,
    /// The registry this channel is registered in, if any.
    registry: RefCell<Weak<registry::ChannelRegistry>>,
    /// True if this channel came in through a listener, rather than
    /// being started locally.
    initiated_remotely: StdCell<bool>,
    /// SHA-1 digest of the remote peer's identity key; zero-filled
    /// when unknown.
    identity_digest: RefCell<[u8; ID_LEN]>,
    /// Human-readable name of the peer, if any.
    nickname: RefCell<Option<String>>,
    /// Time at which a non-padding cell was last submitted for
    /// writing.
    timestamp_last_added_nonpadding: StdCell<u64>,
    /// Time at which a client last used this channel.
    client_used: StdCell<u64>,
    /// Seed for allocating circuit IDs on this channel.
    next_circ_id: StdCell<u16>,
    /// Which half of the circuit-ID space we may allocate from.
    circ_id_range: StdCell<CircIdRange>,
    /// Correlation key for directory-request accounting; 0 if unused.
    dirreq_id: StdCell<u64>,
    /// Handler for inbound fixed-length cells.
    cell_handler: RefCell<Option<CellHandler>>,
    /// Handler for inbound variable-length cells.
    var_cell_handler: RefCell<Option<VarCellHandler>>,
    /// Handler for accepted child channels, on a listening channel.
    listener: RefCell<Option<ListenerFn>>,
    /// The transport bound to this channel, if any.
    transport: RefCell<Option<Rc<dyn Transport>>>,
    /// Outbound cells not yet handed to the transport.
    outgoing_queue: RefCell<VecDeque<AnyCell>>,
    /// Inbound cells waiting for a handler.
    cell_queue: RefCell<VecDeque<AnyCell>>,
    /// Accepted-but-undispatched child channels, on a listening
    /// channel.
    incoming_list: RefCell<VecDeque<Channel>>,
    /// Priority queue of circuits eligible to send, for the scheduler.
    active_circuit_pqueue: RefCell<pqueue::CircPQueue>,
    /// Collaborator handles.
    env: Rc<LinkEnv>,
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        // Freeing a live channel is a programming error: the last
        // handle may only go away once the channel is terminal,
        // unregistered, and its queues have been drained.
        if !std::thread::panicking() {
            debug_assert!(self.state.get().is_terminal());
            debug_assert!(!self.registered.get());
            debug_assert!(self.outgoing_queue.borrow().is_empty());
            debug_assert!(self.cell_queue.borrow().is_empty());
            debug_assert!(self.incoming_list.borrow().is_empty());
        }
    }
}

/// A cheap-to-clone handle to a channel.
///
/// Cloning the handle is the reference-counting operation: any code
/// that holds a clone keeps the channel alive, and the channel is
/// freed when the registry, the transport, and every caller have let
/// go of theirs.
#[derive(Clone)]
pub struct Channel {
    /// The shared core.
    core: Rc<ChannelCore>,
}

/// A weak handle to a channel, held by transports.
///
/// Upgrading fails once the channel has been freed.
#[derive(Clone)]
pub struct WeakChannel {
    /// The weak reference to the shared core.
    core: Weak<ChannelCore>,
}

impl WeakChannel {
    /// Try to recover a usable handle to this channel.
    pub fn upgrade(&self) -> Option<Channel> {
        self.core.upgrade().map(|core| Channel { core })
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("unique_id", &self.core.unique_id)
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl Channel {
    /// Construct a new channel in the Closed state, with a fresh id
    /// and a randomized circuit-ID seed.
    pub fn new(env: Rc<LinkEnv>) -> Self {
        let now = env.clock.approx_now();
        let next_circ_id = env.rng.pick_u16(1 << 15);
        let core = ChannelCore {
            unique_id: UniqId::new(),
            state: StdCell::new(ChannelState::Closed),
            reason_for_closing: StdCell::new(CloseReason::NotClosing),
            registered: StdCell::new(false),
            registry: RefCell::new(Weak::new()),
            initiated_remotely: StdCell::new(false),
            identity_digest: RefCell::new([0_u8; ID_LEN]),
            nickname: RefCell::new(None),
            timestamp_last_added_nonpadding: StdCell::new(now),
            client_used: StdCell::new(0),
            next_circ_id: StdCell::new(next_circ_id),
            circ_id_range: StdCell::new(CircIdRange::All),
            dirreq_id: StdCell::new(0),
            cell_handler: RefCell::new(None),
            var_cell_handler: RefCell::new(None),
            listener: RefCell::new(None),
            transport: RefCell::new(None),
            outgoing_queue: RefCell::new(VecDeque::new()),
            cell_queue: RefCell::new(VecDeque::new()),
            incoming_list: RefCell::new(VecDeque::new()),
            active_circuit_pqueue: RefCell::new(pqueue::CircPQueue::new()),
            env,
        };
        Channel {
            core: Rc::new(core),
        }
    }

    /// Construct a new channel in the Listening state.
    pub fn new_listener(env: Rc<LinkEnv>) -> Result<Self> {
        let chan = Channel::new(env);
        chan.change_state(ChannelState::Listening)?;
        Ok(chan)
    }

    /// Return a weak handle to this channel.
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            core: Rc::downgrade(&self.core),
        }
    }

    /// Return true if `self` and `other` are handles to the same
    /// channel.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }

    /// Return this channel's process-unique identifier.
    pub fn unique_id(&self) -> UniqId {
        self.core.unique_id
    }

    /// Return this channel's current state.
    pub fn state(&self) -> ChannelState {
        self.core.state.get()
    }

    /// Return the reason this channel is closing, or
    /// [`CloseReason::NotClosing`].
    pub fn reason_for_closing(&self) -> CloseReason {
        self.core.reason_for_closing.get()
    }

    /// Return true if this channel is currently registered.
    pub fn is_registered(&self) -> bool {
        self.core.registered.get()
    }

    /// Return true if this channel was started locally, rather than
    /// accepted by a listener.
    pub fn was_started_here(&self) -> bool {
        !self.core.initiated_remotely.get()
    }

    /// Note that this channel came in through a listener.
    pub(crate) fn set_initiated_remotely(&self) {
        self.core.initiated_remotely.set(true);
    }

    /// Return the remote peer's identity digest; zero-filled when
    /// unknown.
    pub fn identity_digest(&self) -> [u8; ID_LEN] {
        *self.core.identity_digest.borrow()
    }

    /// Return the remote peer's nickname, if known.
    pub fn nickname(&self) -> Option<String> {
        self.core.nickname.borrow().clone()
    }

    /// Set the remote end metadata (identity digest and nickname) of
    /// this channel.
    pub fn set_remote_end(&self, identity_digest: Option<&[u8; ID_LEN]>, nickname: Option<&str>) {
        match identity_digest {
            Some(d) => *self.core.identity_digest.borrow_mut() = *d,
            None => *self.core.identity_digest.borrow_mut() = [0_u8; ID_LEN],
        }
        *self.core.nickname.borrow_mut() = nickname.map(|s| s.to_owned());
    }

    /// Clear the remote end metadata (identity digest and nickname) of
    /// this channel.
    pub fn clear_remote_end(&self) {
        self.set_remote_end(None, None);
    }

    /// Return the time at which a non-padding cell was last submitted
    /// for writing on this channel.
    pub fn timestamp_last_added_nonpadding(&self) -> u64 {
        self.core.timestamp_last_added_nonpadding.get()
    }

    /// Mark this channel with the current time, for client
    /// rate-limiting decisions.
    pub fn touched_by_client(&self) {
        self.core.client_used.set(self.core.env.clock.now());
    }

    /// Return the time at which a client last used this channel.
    pub fn client_used(&self) -> u64 {
        self.core.client_used.get()
    }

    /// Return the seed from which circuit IDs on this channel are
    /// allocated.
    pub fn next_circ_id(&self) -> u16 {
        self.core.next_circ_id.get()
    }

    /// Replace the circuit-ID allocation seed.
    pub fn set_next_circ_id(&self, id: u16) {
        self.core.next_circ_id.set(id);
    }

    /// Return which half of the circuit-ID space this channel may
    /// allocate from.
    pub fn circ_id_range(&self) -> CircIdRange {
        self.core.circ_id_range.get()
    }

    /// Record which half of the circuit-ID space this channel may
    /// allocate from, as decided from the peer's identity key during
    /// the link handshake.
    pub fn set_circ_id_range(&self, range: CircIdRange) {
        self.core.circ_id_range.set(range);
    }

    /// Allocate a fresh circuit ID for an outgoing circuit on this
    /// channel.
    ///
    /// The 15-bit seed advances on every call, skipping zero, and the
    /// high bit of the result is forced to match this channel's
    /// [`CircIdRange`].
    pub fn alloc_circ_id(&self) -> CircId {
        let mut id = self.core.next_circ_id.get();
        if id == 0 {
            // A zero circuit ID denotes "no circuit".
            id = 1;
        }
        let next = if id >= (1 << 15) - 1 { 1 } else { id + 1 };
        self.core.next_circ_id.set(next);
        CircId::from(u32::from(self.circ_id_range().apply(id)))
    }

    /// Return the directory-request correlation key, or 0.
    pub fn dirreq_id(&self) -> u64 {
        self.core.dirreq_id.get()
    }

    /// Set the directory-request correlation key.
    pub fn set_dirreq_id(&self, id: u64) {
        self.core.dirreq_id.set(id);
    }

    /// Run a closure with mutable access to the scheduler's priority
    /// queue of sendable circuits.
    pub fn with_active_circuit_pqueue<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut pqueue::CircPQueue) -> T,
    {
        f(&mut self.core.active_circuit_pqueue.borrow_mut())
    }

    /// Return the collaborator bundle this channel was created with.
    pub fn env(&self) -> &Rc<LinkEnv> {
        &self.core.env
    }

    /// Install (or remove) the transport for this channel.
    pub fn set_transport(&self, transport: Option<Rc<dyn Transport>>) {
        *self.core.transport.borrow_mut() = transport;
    }

    /// Record that this channel is now in the given registry.
    pub(crate) fn note_registered(&self, registry: Weak<registry::ChannelRegistry>) {
        *self.core.registry.borrow_mut() = registry;
        self.core.registered.set(true);
    }

    /// Record that this channel has left its registry.
    pub(crate) fn note_unregistered(&self) {
        self.core.registered.set(false);
        *self.core.registry.borrow_mut() = Weak::new();
    }

    /// Change this channel's state, enforcing the transition table.
    ///
    /// An illegal transition is refused with an error and no mutation.
    /// On entering Open, queued work is drained; on entering Closed,
    /// every queue must already be empty.
    pub fn change_state(&self, to_state: ChannelState) -> Result<()> {
        let from_state = self.state();
        if from_state == to_state {
            debug!(
                "{}: no-op transition from \"{}\" to itself",
                self.unique_id(),
                to_state
            );
            return Ok(());
        }
        if !from_state.can_transition(to_state) {
            return Err(Error::Internal(format!(
                "invalid channel state transition from \"{}\" to \"{}\"",
                from_state, to_state
            )));
        }
        if to_state.is_closing_or_terminal()
            && self.reason_for_closing() == CloseReason::NotClosing
        {
            return Err(Error::Internal(format!(
                "tried to enter \"{}\" without a close reason",
                to_state
            )));
        }

        debug!(
            "{}: changing state from \"{}\" to \"{}\"",
            self.unique_id(),
            from_state,
            to_state
        );
        self.core.state.set(to_state);

        if self.is_registered() {
            if let Some(registry) = self.core.registry.borrow().upgrade() {
                registry.note_state_change(self, from_state, to_state);
            }
        }

        if to_state == ChannelState::Open {
            self.do_open_actions();
            if !self.core.cell_queue.borrow().is_empty() {
                self.process_cells()?;
            }
            if !self.core.outgoing_queue.borrow().is_empty() {
                self.flush_cells();
            }
        } else if to_state == ChannelState::Closed {
            debug_assert!(self.core.cell_queue.borrow().is_empty());
            debug_assert!(self.core.outgoing_queue.borrow().is_empty());
            debug_assert!(self.core.incoming_list.borrow().is_empty());
        }
        Ok(())
    }

    /// Try to close this channel from above, invoking the transport's
    /// close method.
    ///
    /// The transport is responsible for eventually completing the
    /// shutdown by calling [`Channel::closed`].  No-op if the channel
    /// is already closing or finished.
    pub fn request_close(&self) -> Result<()> {
        if self.state().is_closing_or_terminal() {
            return Ok(());
        }
        debug!("{}: closing by request", self.unique_id());
        self.core.reason_for_closing.set(CloseReason::Requested);
        self.change_state(ChannelState::Closing)?;
        let transport = self.core.transport.borrow().clone();
        if let Some(t) = transport {
            let chan = self.clone();
            t.close(&chan);
        }
        Ok(())
    }

    /// Note that the lower layer is closing this channel for a
    /// non-error reason.
    ///
    /// Does not invoke the transport's close method, since the lower
    /// layer already knows.
    pub fn close_from_lower_layer(&self) -> Result<()> {
        if self.state().is_closing_or_terminal() {
            return Ok(());
        }
        debug!("{}: closing due to lower-layer event", self.unique_id());
        self.core.reason_for_closing.set(CloseReason::FromBelow);
        self.change_state(ChannelState::Closing)
    }

    /// Note that the lower layer is closing this channel because of an
    /// error.
    ///
    /// Does not invoke the transport's close method, since the lower
    /// layer already knows.
    pub fn close_for_error(&self) -> Result<()> {
        if self.state().is_closing_or_terminal() {
            return Ok(());
        }
        debug!("{}: closing due to lower-layer error", self.unique_id());
        self.core.reason_for_closing.set(CloseReason::ForError);
        self.change_state(ChannelState::Closing)
    }

    /// Note that the lower layer has finished tearing this channel
    /// down.
    ///
    /// Circuits pending on the channel are told to give up if the
    /// close was for an error; attached circuits are unlinked either
    /// way, and the channel comes to rest in Closed or Error.
    pub fn closed(&self) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Ok(());
        }
        if state != ChannelState::Closing {
            return Err(Error::Internal(format!(
                "channel marked closed while \"{}\"",
                state
            )));
        }
        let chan = self.clone();
        if self.reason_for_closing() == CloseReason::ForError {
            // Inform any pending (not attached) circs that they
            // should give up.
            self.core.env.circuits.n_chan_done(&chan, false);
            // Cells stranded by the error are undeliverable.
            self.core.cell_queue.borrow_mut().clear();
            self.core.outgoing_queue.borrow_mut().clear();
        }
        // Now close all the attached circuits on it.
        self.core
            .env
            .circuits
            .unlink_all_from_channel(&chan, DestroyReason::CHANNEL_CLOSED);

        if self.reason_for_closing() != CloseReason::ForError {
            self.change_state(ChannelState::Closed)
        } else {
            self.change_state(ChannelState::Error)
        }
    }

    /// Return the installed fixed-cell handler, if the channel is in a
    /// state where cells can arrive.
    pub fn cell_handler(&self) -> Option<CellHandler> {
        if self.handlers_usable() {
            self.core.cell_handler.borrow().clone()
        } else {
            None
        }
    }

    /// Return the installed variable-cell handler, if the channel is
    /// in a state where cells can arrive.
    pub fn var_cell_handler(&self) -> Option<VarCellHandler> {
        if self.handlers_usable() {
            self.core.var_cell_handler.borrow().clone()
        } else {
            None
        }
    }

    /// Return true if this channel's state allows cell handlers to be
    /// installed or consulted.
    fn handlers_usable(&self) -> bool {
        matches!(
            self.state(),
            ChannelState::Opening | ChannelState::Open | ChannelState::Maint
        )
    }

    /// Install or remove the fixed-cell handler.
    ///
    /// If a handler was newly installed and matching cells are
    /// queued, they are dispatched before this call returns.
    pub fn set_cell_handler(&self, handler: Option<CellHandler>) -> Result<()> {
        if !self.handlers_usable() {
            return Err(Error::Internal(format!(
                "tried to set a cell handler while \"{}\"",
                self.state()
            )));
        }
        let changed = {
            let old = self.core.cell_handler.borrow();
            !handlers_eq(old.as_ref(), handler.as_ref())
        };
        let installed = handler.is_some();
        *self.core.cell_handler.borrow_mut() = handler;
        if changed && installed && !self.core.cell_queue.borrow().is_empty() {
            self.process_cells()?;
        }
        Ok(())
    }

    /// Install or remove the variable-cell handler.
    ///
    /// If a handler was newly installed and matching cells are
    /// queued, they are dispatched before this call returns.
    pub fn set_var_cell_handler(&self, handler: Option<VarCellHandler>) -> Result<()> {
        if !self.handlers_usable() {
            return Err(Error::Internal(format!(
                "tried to set a var-cell handler while \"{}\"",
                self.state()
            )));
        }
        let changed = {
            let old = self.core.var_cell_handler.borrow();
            !handlers_eq(old.as_ref(), handler.as_ref())
        };
        let installed = handler.is_some();
        *self.core.var_cell_handler.borrow_mut() = handler;
        if changed && installed && !self.core.cell_queue.borrow().is_empty() {
            self.process_cells()?;
        }
        Ok(())
    }

    /// Install or remove both cell handlers at once.
    pub fn set_cell_handlers(
        &self,
        cell_handler: Option<CellHandler>,
        var_cell_handler: Option<VarCellHandler>,
    ) -> Result<()> {
        if !self.handlers_usable() {
            return Err(Error::Internal(format!(
                "tried to set cell handlers while \"{}\"",
                self.state()
            )));
        }
        let try_again = {
            let old_f = self.core.cell_handler.borrow();
            let old_v = self.core.var_cell_handler.borrow();
            (cell_handler.is_some() && !handlers_eq(old_f.as_ref(), cell_handler.as_ref()))
                || (var_cell_handler.is_some()
                    && !handlers_eq(old_v.as_ref(), var_cell_handler.as_ref()))
        };
        *self.core.cell_handler.borrow_mut() = cell_handler;
        *self.core.var_cell_handler.borrow_mut() = var_cell_handler;
        if try_again && !self.core.cell_queue.borrow().is_empty() {
            self.process_cells()?;
        }
        Ok(())
    }

    /// Process as many queued inbound cells as we can.
    ///
    /// Cells are dispatched in arrival order; the first cell whose
    /// kind has no installed handler stops the drain, and everything
    /// after it stays queued.
    pub fn process_cells(&self) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            ChannelState::Closing | ChannelState::Maint | ChannelState::Open
        ) {
            return Err(Error::Internal(format!(
                "tried to process queued cells while \"{}\"",
                state
            )));
        }
        trace!("{}: processing queued cells", self.unique_id());
        let chan = self.clone();
        loop {
            // Re-read the handler slots on each pass: a handler may
            // swap them out from under us.
            let front_is_fixed = match self.core.cell_queue.borrow().front() {
                Some(AnyCell::Fixed(_)) => true,
                Some(AnyCell::Var(_)) => false,
                None => break,
            };
            if front_is_fixed {
                let handler = match self.core.cell_handler.borrow().clone() {
                    Some(h) => h,
                    None => break,
                };
                let cell = match self.core.cell_queue.borrow_mut().pop_front() {
                    Some(AnyCell::Fixed(c)) => c,
                    _ => break,
                };
                handler(&chan, cell);
            } else {
                let handler = match self.core.var_cell_handler.borrow().clone() {
                    Some(h) => h,
                    None => break,
                };
                let cell = match self.core.cell_queue.borrow_mut().pop_front() {
                    Some(AnyCell::Var(c)) => c,
                    _ => break,
                };
                handler(&chan, cell);
            }
        }
        Ok(())
    }

    /// Queue an inbound fixed-length cell, dispatching it at once if a
    /// handler is installed and nothing is ahead of it.
    pub fn queue_cell(&self, cell: Cell) -> Result<()> {
        self.queue_any_cell(AnyCell::Fixed(cell))
    }

    /// Queue an inbound variable-length cell, dispatching it at once
    /// if a handler is installed and nothing is ahead of it.
    pub fn queue_var_cell(&self, cell: VarCell) -> Result<()> {
        self.queue_any_cell(AnyCell::Var(cell))
    }

    /// Common implementation for the inbound queue entry points.
    fn queue_any_cell(&self, cell: AnyCell) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(Error::Internal(format!(
                "cell queued on a channel that is \"{}\"",
                self.state()
            )));
        }
        let backlog = !self.core.cell_queue.borrow().is_empty();
        let handler_for_cell = match &cell {
            AnyCell::Fixed(_) => self.core.cell_handler.borrow().is_some(),
            AnyCell::Var(_) => self.core.var_cell_handler.borrow().is_some(),
        };

        if handler_for_cell && !backlog {
            // Dispatch it right away.
            let chan = self.clone();
            match cell {
                AnyCell::Fixed(c) => {
                    let handler = self.core.cell_handler.borrow().clone();
                    if let Some(h) = handler {
                        h(&chan, c);
                    }
                }
                AnyCell::Var(c) => {
                    let handler = self.core.var_cell_handler.borrow().clone();
                    if let Some(h) = handler {
                        h(&chan, c);
                    }
                }
            }
        } else {
            trace!("{}: queueing incoming cell", self.unique_id());
            self.core.cell_queue.borrow_mut().push_back(cell);
            let any_handler = self.core.cell_handler.borrow().is_some()
                || self.core.var_cell_handler.borrow().is_some();
            if any_handler {
                self.process_cells()?;
            }
        }
        Ok(())
    }

    /// Submit a fixed-length cell for transmission.
    ///
    /// Legal only while the channel is Opening, Open, or Maint.  When
    /// the channel is Open and nothing else is waiting, the cell goes
    /// straight to the transport; otherwise it waits in the outgoing
    /// queue.
    pub fn write_cell(&self, cell: Cell) -> Result<()> {
        self.write_any_cell(AnyCell::Fixed(cell))
    }

    /// Submit a variable-length cell for transmission.
    ///
    /// Same rules as [`Channel::write_cell`].
    pub fn write_var_cell(&self, cell: VarCell) -> Result<()> {
        self.write_any_cell(AnyCell::Var(cell))
    }

    /// Common implementation for the outbound write entry points.
    fn write_any_cell(&self, cell: AnyCell) -> Result<()> {
        let state = self.state();
        if !matches!(
            state,
            ChannelState::Opening | ChannelState::Open | ChannelState::Maint
        ) {
            return Err(Error::Internal(format!(
                "cell written to a channel that is \"{}\"",
                state
            )));
        }
        if self.core.transport.borrow().is_none() {
            return Err(Error::Internal(
                "cell written to a channel with no transport".into(),
            ));
        }

        if !cell.cmd().is_padding() {
            self.core
                .timestamp_last_added_nonpadding
                .set(self.core.env.clock.approx_now());
        }

        let queue_empty = self.core.outgoing_queue.borrow().is_empty();
        if queue_empty && state == ChannelState::Open {
            // Fast path: straight to the transport.
            let transport = self.core.transport.borrow().clone();
            if let Some(t) = transport {
                let chan = self.clone();
                match cell {
                    AnyCell::Fixed(c) => t.write_cell(&chan, c),
                    AnyCell::Var(c) => t.write_var_cell(&chan, c),
                }
            }
        } else {
            self.core.outgoing_queue.borrow_mut().push_back(cell);
            if state == ChannelState::Open {
                self.flush_cells();
            }
        }
        Ok(())
    }

    /// Hand as many queued outbound cells as possible to the
    /// transport.
    pub fn flush_cells(&self) {
        while self.state() == ChannelState::Open {
            let cell = match self.core.outgoing_queue.borrow_mut().pop_front() {
                Some(c) => c,
                None => break,
            };
            let transport = self.core.transport.borrow().clone();
            let t = match transport {
                Some(t) => t,
                None => {
                    // Put it back; nothing can carry it yet.
                    self.core.outgoing_queue.borrow_mut().push_front(cell);
                    break;
                }
            };
            let chan = self.clone();
            match cell {
                AnyCell::Fixed(c) => t.write_cell(&chan, c),
                AnyCell::Var(c) => t.write_var_cell(&chan, c),
            }
        }
    }

    /// Construct and submit a DESTROY cell for `circ_id`.
    ///
    /// `reason` is deliberately not range-checked: reasons from peers
    /// are propagated verbatim.
    pub fn send_destroy(&self, circ_id: CircId, reason: u8) -> Result<()> {
        let mut cell = Cell::new(circ_id, ChanCmd::DESTROY);
        cell.payload_mut()[0] = reason;
        debug!("{}: sending destroy (circID {})", self.unique_id(), circ_id);
        self.write_cell(cell)
    }

    /// Return the installed listener callback, if this channel is
    /// listening.
    pub fn listener(&self) -> Option<ListenerFn> {
        if self.state() == ChannelState::Listening {
            self.core.listener.borrow().clone()
        } else {
            None
        }
    }

    /// Install or remove the listener callback on a listening channel.
    ///
    /// Installing a listener drains any backlog of accepted child
    /// channels before this call returns.
    pub fn set_listener(&self, listener: Option<ListenerFn>) -> Result<()> {
        if self.state() != ChannelState::Listening {
            return Err(Error::Internal(format!(
                "tried to set a listener on a channel that is \"{}\"",
                self.state()
            )));
        }
        let installed = listener.is_some();
        *self.core.listener.borrow_mut() = listener;
        if installed {
            self.process_incoming()?;
        }
        Ok(())
    }

    /// Queue a child channel accepted by this listening channel,
    /// dispatching it at once if a listener callback is installed and
    /// no backlog exists.
    pub fn queue_incoming(&self, incoming: Channel) -> Result<()> {
        if self.state() != ChannelState::Listening {
            return Err(Error::Internal(format!(
                "incoming channel queued on a channel that is \"{}\"",
                self.state()
            )));
        }
        if incoming.state() == ChannelState::Listening {
            return Err(Error::Internal(
                "a listener accepted another listener".into(),
            ));
        }
        debug!(
            "{}: queueing incoming channel {}",
            self.unique_id(),
            incoming.unique_id()
        );
        incoming.set_initiated_remotely();

        let backlog = !self.core.incoming_list.borrow().is_empty();
        let listener = self.core.listener.borrow().clone();
        match listener {
            Some(l) if !backlog => {
                let me = self.clone();
                l(&me, incoming);
            }
            maybe_l => {
                self.core.incoming_list.borrow_mut().push_back(incoming);
                if maybe_l.is_some() {
                    self.process_incoming()?;
                }
            }
        }
        Ok(())
    }

    /// Use the listener callback to drain the backlog of accepted
    /// child channels.
    ///
    /// Also permitted while Closing, to drain the backlog of a
    /// listener being shut down.
    pub fn process_incoming(&self) -> Result<()> {
        let state = self.state();
        if !matches!(state, ChannelState::Listening | ChannelState::Closing) {
            return Err(Error::Internal(format!(
                "tried to process incoming channels while \"{}\"",
                state
            )));
        }
        let me = self.clone();
        loop {
            let listener = match self.core.listener.borrow().clone() {
                Some(l) => l,
                None => break,
            };
            let incoming = match self.core.incoming_list.borrow_mut().pop_front() {
                Some(c) => c,
                None => break,
            };
            debug!(
                "{}: handling incoming channel {}",
                self.unique_id(),
                incoming.unique_id()
            );
            incoming.set_initiated_remotely();
            listener(&me, incoming);
        }
        Ok(())
    }

    /// Actions to take when a channel becomes Open.
    ///
    /// On locally-initiated channels this notifies the guard, router,
    /// and circuit subsystems; a guard rejection cancels pending
    /// circuits but leaves the channel open and usable.  On
    /// remotely-initiated channels from unknown peers, the geoip
    /// subsystem hears about a client.
    fn do_open_actions(&self) {
        let env = &self.core.env;
        let now = env.clock.now();
        let id = self.identity_digest();
        let chan = self.clone();
        let mut not_using = false;

        if self.was_started_here() {
            env.circuits.network_is_live();
            env.routers.note_connect_succeeded(&id, now);
            if env.guards.register_connect_status(&id, true, now).is_err() {
                // Cancel any circuits pending on this channel.  We
                // leave it open, though: it didn't actually *fail*,
                // we just chose not to use it.
                info!(
                    "{}: new entry guard was reachable, but closing this \
                     connection so we can retry the earlier entry guards.",
                    self.unique_id()
                );
                env.circuits.n_chan_done(&chan, false);
                not_using = true;
            }
            env.routers.set_router_status(&id, true);
        } else {
            // Only report the connection to the geoip module if the
            // peer is not a known router.
            if !env.routers.is_known_router(&id) {
                env.geoip.note_client_seen(&chan, now);
            }
        }

        if !not_using {
            env.circuits.n_chan_done(&chan, true);
        }
    }

    /// Note that the transport has flushed its outgoing buffer, which
    /// may complete a directory-request transfer.
    pub fn notify_flushed(&self) {
        let dirreq = self.dirreq_id();
        if dirreq != 0 {
            self.core.env.geoip.dirreq_buffer_flushed(dirreq);
        }
    }
}

/// Compare two optional handler Rc's for identity.
fn handlers_eq<T: ?Sized>(a: Option<&Rc<T>>, b: Option<&Rc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{install_transport, new_env, CircEvent, FakeTransport, TestNet};

    /// A channel with a fake transport, parked in Opening.
    fn opening_channel() -> (Channel, Rc<FakeTransport>, TestNet) {
        let (env, net) = new_env();
        let chan = Channel::new(env);
        let transport = FakeTransport::new();
        install_transport(&chan, &transport);
        chan.change_state(ChannelState::Opening).unwrap();
        (chan, transport, net)
    }

    /// A channel with a fake transport, brought all the way to Open.
    fn open_channel() -> (Channel, Rc<FakeTransport>, TestNet) {
        let (chan, transport, net) = opening_channel();
        chan.change_state(ChannelState::Open).unwrap();
        (chan, transport, net)
    }

    /// Bring a channel to rest so that dropping it is legal.
    fn finish(chan: &Channel) {
        match chan.state() {
            ChannelState::Closed | ChannelState::Error => {}
            ChannelState::Closing => chan.closed().unwrap(),
            _ => {
                chan.close_for_error().unwrap();
                chan.closed().unwrap();
            }
        }
    }

    /// A fixed RELAY cell on the given circuit.
    fn relay_cell(circ: u32) -> Cell {
        Cell::new(circ.into(), ChanCmd::RELAY)
    }

    #[test]
    fn new_channel_defaults() {
        let (env, _net) = new_env();
        let chan = Channel::new(env);
        assert_eq!(chan.state(), ChannelState::Closed);
        assert_eq!(chan.reason_for_closing(), CloseReason::NotClosing);
        assert!(!chan.is_registered());
        assert!(chan.was_started_here());
        assert_eq!(chan.identity_digest(), [0_u8; 20]);
        assert_eq!(chan.nickname(), None);
        // The fake entropy source always picks 0x1234, which is
        // already inside [0, 2^15).
        assert_eq!(chan.next_circ_id(), 0x1234);
        assert_eq!(chan.dirreq_id(), 0);
    }

    #[test]
    fn remote_end_metadata() {
        let (env, _net) = new_env();
        let chan = Channel::new(env);
        chan.set_remote_end(Some(&[9_u8; 20]), Some("moria1"));
        assert_eq!(chan.identity_digest(), [9_u8; 20]);
        assert_eq!(chan.nickname().as_deref(), Some("moria1"));
        chan.clear_remote_end();
        assert_eq!(chan.identity_digest(), [0_u8; 20]);
        assert_eq!(chan.nickname(), None);
    }

    #[test]
    fn illegal_transition_refused() {
        let (chan, _transport, _net) = opening_channel();
        let err = chan.change_state(ChannelState::Listening).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        // No mutation on refusal.
        assert_eq!(chan.state(), ChannelState::Opening);
        finish(&chan);
    }

    #[test]
    fn closing_requires_reason() {
        let (chan, _transport, _net) = opening_channel();
        let err = chan.change_state(ChannelState::Closing).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(chan.state(), ChannelState::Opening);
        finish(&chan);
    }

    #[test]
    fn request_close_flow() {
        let (chan, transport, net) = open_channel();
        chan.request_close().unwrap();
        assert_eq!(chan.state(), ChannelState::Closing);
        assert_eq!(chan.reason_for_closing(), CloseReason::Requested);
        assert!(transport.closed.get());

        // The transport finishes tearing down.
        chan.closed().unwrap();
        assert_eq!(chan.state(), ChannelState::Closed);
        let events = net.circuits.events.borrow();
        let destroy_reason: u8 =
            orlink_cell::chancell::msg::DestroyReason::CHANNEL_CLOSED.into();
        assert!(events.contains(&CircEvent::Unlink(chan.unique_id(), destroy_reason)));
        // A requested close is not a failure.
        assert!(!events.contains(&CircEvent::NChanDone(chan.unique_id(), false)));
    }

    #[test]
    fn error_close_flow() {
        let (chan, _transport, net) = open_channel();
        chan.close_for_error().unwrap();
        assert_eq!(chan.reason_for_closing(), CloseReason::ForError);
        chan.closed().unwrap();
        assert_eq!(chan.state(), ChannelState::Error);
        let events = net.circuits.events.borrow();
        assert!(events.contains(&CircEvent::NChanDone(chan.unique_id(), false)));
    }

    #[test]
    fn close_noops_when_already_closing() {
        let (chan, _transport, _net) = open_channel();
        chan.request_close().unwrap();
        // Later close notifications change nothing.
        chan.close_from_lower_layer().unwrap();
        chan.close_for_error().unwrap();
        chan.request_close().unwrap();
        assert_eq!(chan.reason_for_closing(), CloseReason::Requested);
        assert_eq!(chan.state(), ChannelState::Closing);
        finish(&chan);
    }

    #[test]
    fn destroy_round_trip() {
        let (chan, transport, net) = open_channel();
        net.clock.set(1_222_333);
        chan.send_destroy(0x1234.into(), 7).unwrap();

        let written = transport.written.borrow();
        assert_eq!(written.len(), 1);
        match &written[0] {
            AnyCell::Fixed(c) => {
                assert_eq!(c.circid(), CircId::from(0x1234));
                assert_eq!(c.cmd(), ChanCmd::DESTROY);
                assert_eq!(c.payload()[0], 7);
                assert!(c.payload()[1..].iter().all(|b| *b == 0));
            }
            AnyCell::Var(_) => panic!("destroy came out variable-length"),
        }
        assert_eq!(chan.timestamp_last_added_nonpadding(), 1_222_333);
        drop(written);
        finish(&chan);
    }

    #[test]
    fn padding_is_not_counted_as_traffic() {
        let (chan, transport, net) = open_channel();
        let before = chan.timestamp_last_added_nonpadding();
        net.clock.set(before + 50);
        chan.write_cell(Cell::new(0.into(), ChanCmd::PADDING)).unwrap();
        assert_eq!(chan.timestamp_last_added_nonpadding(), before);
        chan.write_cell(relay_cell(5)).unwrap();
        assert_eq!(chan.timestamp_last_added_nonpadding(), before + 50);
        assert_eq!(transport.cmds(), vec![ChanCmd::PADDING, ChanCmd::RELAY]);
        finish(&chan);
    }

    #[test]
    fn writes_queue_until_open() {
        let (chan, transport, _net) = opening_channel();
        chan.write_cell(relay_cell(3)).unwrap();
        chan.write_cell(relay_cell(4)).unwrap();
        assert!(transport.written.borrow().is_empty());

        chan.change_state(ChannelState::Open).unwrap();
        let circids: Vec<u32> = transport
            .written
            .borrow()
            .iter()
            .map(|c| c.circid().into())
            .collect();
        assert_eq!(circids, vec![3, 4]);
        finish(&chan);
    }

    #[test]
    fn write_refused_in_wrong_state() {
        let (env, _net) = new_env();
        let chan = Channel::new(env);
        let transport = FakeTransport::new();
        install_transport(&chan, &transport);
        let err = chan.write_cell(relay_cell(1)).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn direct_dispatch_with_handler_installed() {
        let (chan, _transport, _net) = open_channel();
        let got: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        chan.set_cell_handler(Some(Rc::new(move |_c, cell| {
            got2.borrow_mut().push(cell.circid().into());
        })))
        .unwrap();
        chan.queue_cell(relay_cell(11)).unwrap();
        chan.queue_cell(relay_cell(12)).unwrap();
        assert_eq!(*got.borrow(), vec![11, 12]);
        finish(&chan);
    }

    #[test]
    fn late_bound_handlers() {
        // A variable cell and two fixed cells arrive with no handlers
        // installed.
        let (chan, _transport, _net) = open_channel();
        chan.queue_var_cell(VarCell::new(0.into(), ChanCmd::VPADDING, &b"xx"[..]))
            .unwrap();
        chan.queue_cell(relay_cell(1)).unwrap();
        chan.queue_cell(relay_cell(2)).unwrap();

        // Installing the variable handler dispatches only the
        // variable cell: the drain stops at the first fixed cell.
        let vars: Rc<RefCell<Vec<ChanCmd>>> = Rc::new(RefCell::new(Vec::new()));
        let vars2 = Rc::clone(&vars);
        chan.set_var_cell_handler(Some(Rc::new(move |_c, cell| {
            vars2.borrow_mut().push(cell.cmd());
        })))
        .unwrap();
        assert_eq!(*vars.borrow(), vec![ChanCmd::VPADDING]);

        // Installing the fixed handler afterwards drains the fixed
        // cells in their original order.
        let fixed: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
        let fixed2 = Rc::clone(&fixed);
        chan.set_cell_handler(Some(Rc::new(move |_c, cell| {
            fixed2.borrow_mut().push(cell.circid().into());
        })))
        .unwrap();
        assert_eq!(*fixed.borrow(), vec![1, 2]);
        finish(&chan);
    }

    #[test]
    fn handler_reinstall_is_not_a_rerun() {
        let (chan, _transport, _net) = open_channel();
        let count = Rc::new(StdCell::new(0_usize));
        let count2 = Rc::clone(&count);
        let handler: CellHandler = Rc::new(move |_c, _cell| {
            count2.set(count2.get() + 1);
        });
        chan.set_cell_handler(Some(Rc::clone(&handler))).unwrap();
        chan.queue_cell(relay_cell(1)).unwrap();
        assert_eq!(count.get(), 1);
        // Installing the same handler again must not redispatch
        // anything.
        chan.set_cell_handler(Some(handler)).unwrap();
        assert_eq!(count.get(), 1);
        finish(&chan);
    }

    #[test]
    fn reentrant_close_from_handler() {
        let (chan, transport, _net) = open_channel();
        chan.set_cell_handler(Some(Rc::new(|c, _cell| {
            // A handler may close the channel it was called on.
            c.request_close().unwrap();
        })))
        .unwrap();
        chan.queue_cell(relay_cell(9)).unwrap();
        assert_eq!(chan.state(), ChannelState::Closing);
        assert!(transport.closed.get());
        finish(&chan);
    }

    #[test]
    fn listener_backlog_and_direct() {
        let (env, _net) = new_env();
        let listener = Channel::new_listener(Rc::clone(&env)).unwrap();
        assert_eq!(listener.state(), ChannelState::Listening);

        // With no callback installed, children pile up.
        let child1 = Channel::new(Rc::clone(&env));
        listener.queue_incoming(child1.clone()).unwrap();
        assert!(child1.was_started_here() == false);

        let got: Rc<RefCell<Vec<UniqId>>> = Rc::new(RefCell::new(Vec::new()));
        let got2 = Rc::clone(&got);
        listener
            .set_listener(Some(Rc::new(move |_l, child| {
                got2.borrow_mut().push(child.unique_id());
            })))
            .unwrap();
        assert_eq!(*got.borrow(), vec![child1.unique_id()]);

        // With the callback in place and no backlog, dispatch is
        // immediate.
        let child2 = Channel::new(Rc::clone(&env));
        listener.queue_incoming(child2.clone()).unwrap();
        assert_eq!(*got.borrow(), vec![child1.unique_id(), child2.unique_id()]);
        assert!(!child2.was_started_here());

        // A listener must not accept another listener.
        let bad = Channel::new_listener(Rc::clone(&env)).unwrap();
        assert!(listener.queue_incoming(bad.clone()).is_err());

        for c in [listener, bad] {
            c.close_for_error().unwrap();
            c.closed().unwrap();
        }
    }

    #[test]
    fn guard_rejection_leaves_channel_open() {
        let (chan, _transport, net) = opening_channel();
        chan.set_remote_end(Some(&[7_u8; 20]), None);
        net.guards.reject.set(true);
        chan.change_state(ChannelState::Open).unwrap();

        // The channel stays open; the pending circuits were told to
        // give up.
        assert_eq!(chan.state(), ChannelState::Open);
        let events = net.circuits.events.borrow();
        assert!(events.contains(&CircEvent::NetworkLive));
        assert!(events.contains(&CircEvent::NChanDone(chan.unique_id(), false)));
        assert!(!events.contains(&CircEvent::NChanDone(chan.unique_id(), true)));
        drop(events);
        // The router is still recorded as reachable.
        assert_eq!(*net.routers.statuses.borrow(), vec![([7_u8; 20], true)]);
        finish(&chan);
    }

    #[test]
    fn remote_open_reports_client() {
        let (env, net) = new_env();
        let chan = Channel::new(env);
        chan.set_initiated_remotely();
        let transport = FakeTransport::new();
        install_transport(&chan, &transport);
        chan.change_state(ChannelState::Opening).unwrap();
        chan.change_state(ChannelState::Open).unwrap();

        // Unknown peer: the geoip module hears about a client.
        assert_eq!(net.geoip.clients_seen.get(), 1);
        assert!(net
            .circuits
            .events
            .borrow()
            .contains(&CircEvent::NChanDone(chan.unique_id(), true)));
        // No guard bookkeeping for connections we did not start.
        assert!(net.guards.calls.borrow().is_empty());
        finish(&chan);
    }

    #[test]
    fn handle_count_governs_free() {
        let (env, _net) = new_env();
        let registry = registry::ChannelRegistry::new();
        let chan = Channel::new(env);
        registry.register(&chan);
        let weak = chan.downgrade();
        drop(chan);
        // The registry still holds the channel.
        let chan = weak.upgrade().expect("registry dropped its handle");
        chan.close_for_error().unwrap();
        chan.closed().unwrap();
        registry.unregister(&chan);
        drop(chan);
        // Now every strong handle is gone.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn notify_flushed_reports_dirreq() {
        let (chan, _transport, net) = open_channel();
        chan.notify_flushed();
        assert!(net.geoip.flushed.borrow().is_empty());
        chan.set_dirreq_id(44);
        chan.notify_flushed();
        assert_eq!(*net.geoip.flushed.borrow(), vec![44]);
        finish(&chan);
    }

    #[test]
    fn touched_by_client_updates() {
        let (chan, _transport, net) = open_channel();
        net.clock.set(7_777);
        chan.touched_by_client();
        assert_eq!(chan.client_used(), 7_777);
        finish(&chan);
    }

    #[test]
    fn circ_ids_respect_parity() {
        let (chan, _transport, _net) = open_channel();
        // Fresh channels may draw from the whole space.
        assert_eq!(chan.circ_id_range(), CircIdRange::All);
        chan.set_next_circ_id(0x1200);
        assert_eq!(chan.alloc_circ_id(), CircId::from(0x1200));

        // A side assigned the lower half keeps the high bit clear...
        chan.set_circ_id_range(CircIdRange::Low);
        assert_eq!(chan.alloc_circ_id(), CircId::from(0x1201));
        // ...and one assigned the upper half always sets it.
        chan.set_circ_id_range(CircIdRange::High);
        assert_eq!(chan.alloc_circ_id(), CircId::from(0x9202));
        assert_eq!(chan.next_circ_id(), 0x1203);

        // The seed wraps within its 15-bit space, skipping zero.
        chan.set_next_circ_id(0x7fff);
        assert_eq!(chan.alloc_circ_id(), CircId::from(0xffff));
        assert_eq!(chan.next_circ_id(), 1);
        finish(&chan);
    }

    #[test]
    fn pqueue_is_per_channel() {
        let (chan, _transport, _net) = open_channel();
        chan.with_active_circuit_pqueue(|q| {
            q.push(3.into(), 20);
            q.push(4.into(), 10);
        });
        let popped = chan.with_active_circuit_pqueue(|q| q.pop());
        assert_eq!(popped, Some(4.into()));
        chan.with_active_circuit_pqueue(|q| q.clear());
        finish(&chan);
    }
}
