use std::io;
use thiserror::Error;

use crate::connection::ConnectionState;
use crate::listener::ListenerState;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("can't {operation} a connection in state {state:?}")]
    InvalidState { operation: &'static str, state: ConnectionState },

    #[error("a write continuation is already pending")]
    WritePending,

    #[error("connection already disposed")]
    Disposed,

    #[error("can't {operation} a listener in state {state:?}")]
    InvalidListenerState { operation: &'static str, state: ListenerState },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl NetError {
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    pub fn invalid_listener_state(operation: &'static str, state: ListenerState) -> Self {
        Self::InvalidListenerState { operation, state }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler is not running")]
    NotRunning,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}
