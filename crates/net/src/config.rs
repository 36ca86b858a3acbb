use std::time::Duration;

const DEFAULT_BACKLOG: u32 = 1024;

/// Socket options applied by a [`Listener`](crate::Listener) to its listening
/// socket and to every connection it accepts.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Length of the pending-connection queue passed to `listen(2)`.
    pub backlog: u32,
    /// Sets `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,
    /// Upper bound for one OS read on an accepted connection. A read that takes
    /// longer faults the connection with a timed-out error.
    pub read_timeout: Option<Duration>,
    /// Upper bound for one OS write on an accepted connection.
    pub write_timeout: Option<Duration>,
    /// Sets `TCP_NODELAY` on accepted connections.
    pub nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { backlog: DEFAULT_BACKLOG, reuse_address: true, read_timeout: None, write_timeout: None, nodelay: true }
    }
}

impl ListenerConfig {
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn reuse_address(mut self, reuse_address: bool) -> Self {
        self.reuse_address = reuse_address;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub(crate) fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions { read_timeout: self.read_timeout, write_timeout: self.write_timeout, nodelay: self.nodelay }
    }
}

/// The per-connection subset of [`ListenerConfig`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ConnectionOptions {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub nodelay: bool,
}
