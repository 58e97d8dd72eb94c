//! Process-wide bookkeeping of channels, indexed by state class.
//!
//! Four indices are maintained: every registered channel is in `all`
//! and in exactly one of `active` or `finished`; it is additionally in
//! `listening` iff its state is Listening.  The registry holds the
//! only long-lived strong handle to each channel, so unregistering a
//! finished channel is what ultimately frees it.

use super::{Channel, ChannelState, UniqId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::debug;

/// A set of channels, indexed by state class.
///
/// Create one of these at startup and thread it through the code
/// paths that create channels; drain and drop it at shutdown.
#[derive(Default)]
pub struct ChannelRegistry {
    /// Every registered channel, holding the strong handle.
    all: RefCell<HashMap<UniqId, Channel>>,
    /// Channels that are not in a terminal state.
    active: RefCell<HashSet<UniqId>>,
    /// Channels in the Listening state.
    listening: RefCell<HashSet<UniqId>>,
    /// Channels in a terminal (Closed or Error) state.
    finished: RefCell<HashSet<UniqId>>,
}

impl ChannelRegistry {
    /// Make a new empty registry.
    pub fn new() -> Rc<Self> {
        Rc::new(ChannelRegistry::default())
    }

    /// Add a channel to this registry.  No-op if it is already
    /// registered.
    pub fn register(self: &Rc<Self>, chan: &Channel) {
        if chan.is_registered() {
            return;
        }
        let id = chan.unique_id();
        self.all.borrow_mut().insert(id, chan.clone());
        if chan.state().is_terminal() {
            self.finished.borrow_mut().insert(id);
        } else {
            self.active.borrow_mut().insert(id);
            if chan.state() == ChannelState::Listening {
                self.listening.borrow_mut().insert(id);
            }
        }
        chan.note_registered(Rc::downgrade(self));
        debug!("{}: registered in state \"{}\"", id, chan.state());
    }

    /// Remove a channel from this registry.  No-op if it is not
    /// registered.
    ///
    /// Dropping the registry's handle is what frees a finished,
    /// otherwise-unreferenced channel.
    pub fn unregister(&self, chan: &Channel) {
        if !chan.is_registered() {
            return;
        }
        let id = chan.unique_id();
        if chan.state().is_terminal() {
            self.finished.borrow_mut().remove(&id);
        } else {
            self.active.borrow_mut().remove(&id);
            if chan.state() == ChannelState::Listening {
                self.listening.borrow_mut().remove(&id);
            }
        }
        chan.note_unregistered();
        debug!("{}: unregistered", id);
        self.all.borrow_mut().remove(&id);
    }

    /// Update the indices after a registered channel moved from
    /// `from_state` to `to_state`.
    pub(crate) fn note_state_change(
        &self,
        chan: &Channel,
        from_state: ChannelState,
        to_state: ChannelState,
    ) {
        let id = chan.unique_id();
        let was_active = !from_state.is_terminal();
        let is_active = !to_state.is_terminal();

        if was_active && !is_active {
            self.active.borrow_mut().remove(&id);
            self.finished.borrow_mut().insert(id);
        } else if !was_active && is_active {
            self.finished.borrow_mut().remove(&id);
            self.active.borrow_mut().insert(id);
        }

        let was_listening = from_state == ChannelState::Listening;
        let is_listening = to_state == ChannelState::Listening;
        if !was_listening && is_listening {
            self.listening.borrow_mut().insert(id);
        } else if was_listening && !is_listening {
            self.listening.borrow_mut().remove(&id);
        }
    }

    /// Return the channel registered with the given id, if any.
    pub fn by_id(&self, id: UniqId) -> Option<Channel> {
        self.all.borrow().get(&id).cloned()
    }

    /// Return the number of registered channels.
    pub fn n_channels(&self) -> usize {
        self.all.borrow().len()
    }
    /// Return the number of registered non-terminal channels.
    pub fn n_active(&self) -> usize {
        self.active.borrow().len()
    }
    /// Return the number of registered listening channels.
    pub fn n_listening(&self) -> usize {
        self.listening.borrow().len()
    }
    /// Return the number of registered finished channels.
    pub fn n_finished(&self) -> usize {
        self.finished.borrow().len()
    }

    /// Return true if the channel with the given id is in the active
    /// index.
    pub fn is_active(&self, id: UniqId) -> bool {
        self.active.borrow().contains(&id)
    }
    /// Return true if the channel with the given id is in the
    /// listening index.
    pub fn is_listening(&self, id: UniqId) -> bool {
        self.listening.borrow().contains(&id)
    }
    /// Return true if the channel with the given id is in the finished
    /// index.
    pub fn is_finished(&self, id: UniqId) -> bool {
        self.finished.borrow().contains(&id)
    }

    /// Request a close on every active channel.
    ///
    /// The channels remain registered; the lower layers finish the
    /// shutdowns and the caller unregisters them as they report
    /// closed.
    pub fn close_all(&self) {
        let chans: Vec<Channel> = {
            let all = self.all.borrow();
            let active = self.active.borrow();
            active.iter().filter_map(|id| all.get(id).cloned()).collect()
        };
        for chan in chans {
            if let Err(e) = chan.request_close() {
                debug!("{}: close request failed: {}", chan.unique_id(), e);
            }
        }
    }

    /// Unregister every channel at once, dropping all handles.
    pub fn drain(&self) {
        let chans: Vec<Channel> = self.all.borrow().values().cloned().collect();
        for chan in chans {
            self.unregister(&chan);
        }
    }
}
