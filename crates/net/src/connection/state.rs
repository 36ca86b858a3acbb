//! The connection lifecycle as a pure transition function.
//!
//! [`transition`] maps the current [`ConnectionState`] and an [`Event`] to the
//! next state plus the [`Effect`]s the connection has to perform. It owns no
//! socket and performs no I/O, so every lifecycle rule can be checked in
//! isolation.

use crate::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created for an outbound connect that has not been started.
    NotConnected,
    Connecting,
    /// Both directions are open.
    Connected,
    /// The peer closed its write side; we may still write.
    ReadEnded,
    /// We ended our write side; the peer may still send.
    WriteEnded,
    /// Both sides ended, queued output is still draining.
    Closing,
    Closed,
    Error,
    Disposed,
}

impl ConnectionState {
    /// Whether [`Connection::write`](super::Connection::write) is legal.
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Connected | Self::ReadEnded)
    }

    /// Whether the read side is still open.
    #[inline]
    pub fn is_readable(self) -> bool {
        matches!(self, Self::Connected | Self::WriteEnded)
    }

    /// Whether the connection holds a live socket.
    #[inline]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::ReadEnded | Self::WriteEnded | Self::Closing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect,
    ConnectSucceeded,
    ConnectFailed,
    /// A read returned zero bytes.
    PeerClosed,
    /// The owner half-closed the write side.
    End,
    /// The output buffer became empty.
    Drained,
    /// The peer reset the connection.
    Reset,
    /// Any other transport failure.
    Fault,
    Dispose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    BeginConnect,
    StartReading,
    ShutdownWrite,
    ShutdownBoth,
    DiscardOutput,
    RaiseConnected,
    RaiseReadEnded,
    RaiseError,
    RaiseClosed,
    /// Drop the OS handle and stop every pending operation.
    Release,
}

use ConnectionState as S;
use Effect as E;

const NONE: &[Effect] = &[];

pub type Transition = (ConnectionState, &'static [Effect]);

/// Computes the next state and the effects to apply.
///
/// `output_empty` tells whether the connection's output buffer holds no bytes
/// at the time of the event. Events that make no sense in the current state
/// (a completion arriving after disposal, a second end) leave the state
/// unchanged with no effects; operations the owner may not invoke in the
/// current state are errors.
pub fn transition(state: ConnectionState, event: Event, output_empty: bool) -> Result<Transition, NetError> {
    let next = match (event, state) {
        (Event::Dispose, S::Disposed) => (S::Disposed, NONE),
        (Event::Dispose, S::Connected | S::ReadEnded | S::WriteEnded | S::Closing) => {
            (S::Disposed, &[E::DiscardOutput, E::ShutdownBoth, E::RaiseClosed, E::Release][..])
        }
        (Event::Dispose, _) => (S::Disposed, &[E::DiscardOutput, E::Release][..]),

        (_, S::Disposed) if is_operation(event) => return Err(NetError::Disposed),

        (Event::Connect, S::NotConnected) => (S::Connecting, &[E::BeginConnect][..]),
        (Event::Connect, _) => return Err(NetError::invalid_state("connect", state)),

        (Event::ConnectSucceeded, S::Connecting) => (S::Connected, &[E::RaiseConnected, E::StartReading][..]),
        (Event::ConnectFailed, S::Connecting) => (S::Error, &[E::RaiseError, E::RaiseClosed][..]),

        (Event::End, S::NotConnected | S::Connecting) => return Err(NetError::invalid_state("end", state)),
        (Event::End, S::Connected) if output_empty => (S::WriteEnded, &[E::ShutdownWrite][..]),
        (Event::End, S::Connected) => (S::WriteEnded, NONE),
        (Event::End, S::ReadEnded) if output_empty => (S::Closed, &[E::ShutdownBoth, E::RaiseClosed][..]),
        (Event::End, S::ReadEnded) => (S::Closing, NONE),

        (Event::PeerClosed, S::Connected) => (S::ReadEnded, &[E::RaiseReadEnded][..]),
        (Event::PeerClosed, S::WriteEnded) if output_empty => {
            (S::Closed, &[E::RaiseReadEnded, E::ShutdownBoth, E::RaiseClosed][..])
        }
        (Event::PeerClosed, S::WriteEnded) => (S::Closing, &[E::RaiseReadEnded][..]),

        (Event::Drained, S::WriteEnded) => (S::WriteEnded, &[E::ShutdownWrite][..]),
        (Event::Drained, S::Closing) => (S::Closed, &[E::ShutdownBoth, E::RaiseClosed][..]),

        (Event::Reset, S::Connected | S::WriteEnded) => {
            (S::Closed, &[E::DiscardOutput, E::RaiseReadEnded, E::ShutdownBoth, E::RaiseClosed][..])
        }
        (Event::Reset, S::ReadEnded | S::Closing) => {
            (S::Closed, &[E::DiscardOutput, E::ShutdownBoth, E::RaiseClosed][..])
        }

        (Event::Fault, S::Connected | S::ReadEnded | S::WriteEnded | S::Closing) => {
            (S::Error, &[E::DiscardOutput, E::ShutdownBoth, E::RaiseError, E::RaiseClosed][..])
        }

        _ => (state, NONE),
    };
    Ok(next)
}

/// Events the owner triggers directly, as opposed to I/O completions.
fn is_operation(event: Event) -> bool {
    matches!(event, Event::Connect | Event::End)
}
