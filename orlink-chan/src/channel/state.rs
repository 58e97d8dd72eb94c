//! States for a channel, and the rules for moving between them.

/// The state of a channel.
///
/// See the transition table in [`ChannelState::can_transition`] for
/// which moves are legal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ChannelState {
    /// Closed, not registered with any connection.  The initial state,
    /// and one of the two terminal resting states.
    Closed,
    /// The lower layer is in the process of shutting the channel down.
    Closing,
    /// The channel died because of an error; terminal.
    Error,
    /// A listening channel that accepts incoming child channels rather
    /// than carrying cells itself.
    Listening,
    /// Temporarily unable to carry cells (for example, during a TLS
    /// renegotiation); queued writes accumulate.
    Maint,
    /// The lower-layer connection and the link handshake are still in
    /// progress.
    Opening,
    /// Fully open and able to carry cells.
    Open,
}

impl ChannelState {
    /// Return true if this is one of the two terminal states.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Error)
    }

    /// Return true if this channel is closing or already finished.
    pub fn is_closing_or_terminal(self) -> bool {
        matches!(
            self,
            ChannelState::Closing | ChannelState::Closed | ChannelState::Error
        )
    }

    /// Return true if a transition from this state to `to` is
    /// permitted.
    pub fn can_transition(self, to: ChannelState) -> bool {
        use ChannelState::*;
        match self {
            Closed => matches!(to, Listening | Opening),
            Closing => matches!(to, Closed | Error),
            Error => false,
            Listening => matches!(to, Closing | Error),
            Maint => matches!(to, Closing | Error | Open),
            Opening => matches!(to, Closing | Error | Open),
            Open => matches!(to, Closing | Error | Maint),
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let descr = match self {
            ChannelState::Closed => "closed",
            ChannelState::Closing => "closing",
            ChannelState::Error => "channel error",
            ChannelState::Listening => "listening",
            ChannelState::Maint => "temporarily suspended for maintenance",
            ChannelState::Opening => "opening",
            ChannelState::Open => "open",
        };
        write!(f, "{}", descr)
    }
}

/// Reason that a channel is being closed, or was closed.
///
/// A channel may only enter Closing, Closed, or Error once its reason
/// has been set to something other than `NotClosing`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CloseReason {
    /// The channel is not closing at all.
    NotClosing,
    /// A local caller asked for the close.
    Requested,
    /// The lower layer reported a non-error shutdown.
    FromBelow,
    /// The lower layer reported an error.
    ForError,
}
