//! A bound server socket that accepts connections.
//!
//! The [`Listener`] counts the connections it hands out. After
//! [`close`](Listener::close) it stops accepting and raises
//! [`ListenerHandler::on_closed`] as soon as the last of those connections has
//! closed or been disposed.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::ListenerConfig;
use crate::connection::{Connection, ConnectionHandler};
use crate::lock;
use crate::scheduler::SchedulerHandle;
use crate::NetError;

/// Receives the connections accepted by a [`Listener`].
///
/// Every method is invoked on the scheduler thread.
pub trait ListenerHandler: Send + Sync {
    /// Returns the handler for a freshly accepted connection.
    ///
    /// Returning `None` declines it: the connection is ended and disposed
    /// immediately.
    fn on_connection(&self, connection: &Connection) -> Option<Arc<dyn ConnectionHandler>>;

    /// The accept loop failed; [`on_closed`](Self::on_closed) follows.
    fn on_error(&self, error: NetError) {
        error!(cause = %error, "listener failed");
    }

    /// The listener stopped and no accepted connection is left. Fires once.
    fn on_closed(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Idle,
    Listening,
    /// Close requested while connections are still live.
    Closing,
    Closed,
    /// The accept loop failed.
    Failed,
}

struct Core {
    state: ListenerState,
    live: usize,
    local_addr: Option<SocketAddr>,
}

struct Inner {
    scheduler: SchedulerHandle,
    handler: Arc<dyn ListenerHandler>,
    config: ListenerConfig,
    cancel: CancellationToken,
    core: Mutex<Core>,
}

#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    pub fn new(scheduler: &SchedulerHandle, handler: Arc<dyn ListenerHandler>, config: ListenerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler: scheduler.clone(),
                handler,
                config,
                cancel: CancellationToken::new(),
                core: Mutex::new(Core { state: ListenerState::Idle, live: 0, local_addr: None }),
            }),
        }
    }

    pub fn state(&self) -> ListenerState {
        lock(&self.inner.core).state
    }

    /// The bound address, available once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.core).local_addr
    }

    /// Number of accepted connections that have not closed yet.
    pub fn live_connections(&self) -> usize {
        lock(&self.inner.core).live
    }

    /// Binds `addr` and starts accepting. Valid once, from [`ListenerState::Idle`].
    ///
    /// Returns the bound address, which differs from `addr` when binding port 0.
    pub fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let mut core = lock(&self.inner.core);
        if core.state != ListenerState::Idle {
            return Err(NetError::invalid_listener_state("listen", core.state));
        }

        let listener = self.bind(addr)?;
        let local_addr = listener.local_addr()?;
        core.state = ListenerState::Listening;
        core.local_addr = Some(local_addr);
        drop(core);

        info!(address = %local_addr, "listening");
        self.spawn_accept_loop(listener);
        Ok(local_addr)
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let _io = self.inner.scheduler.io().enter();
        let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
        socket.set_reuseaddr(self.inner.config.reuse_address)?;
        socket.bind(addr)?;
        socket.listen(self.inner.config.backlog)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let this = self.clone();
        let token = self.inner.cancel.clone();
        self.inner.scheduler.spawn_io(async move {
            loop {
                let accepted = select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        trace!(peer = %peer, "accepted connection");
                        let listener = this.clone();
                        this.inner.scheduler.post(move || listener.on_accept(stream));
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(cause = %e, "transient accept error");
                    }
                    Err(e) => {
                        let listener = this.clone();
                        this.inner.scheduler.post(move || listener.on_accept_error(e));
                        break;
                    }
                }
            }
            debug!("accept loop exited");
        });
    }

    fn on_accept(&self, stream: TcpStream) {
        {
            let mut core = lock(&self.inner.core);
            if core.state != ListenerState::Listening {
                return;
            }
            core.live += 1;
        }

        let listener = self.clone();
        let connection = Connection::accepted(
            &self.inner.scheduler,
            stream,
            self.inner.config.connection_options(),
            Box::new(move || listener.release_one()),
        );

        match self.inner.handler.on_connection(&connection) {
            Some(handler) => connection.attach(handler),
            None => {
                debug!(connection = %connection.id(), "connection declined");
                if let Err(e) = connection.end() {
                    trace!(cause = %e, "failed to end declined connection");
                }
                connection.dispose();
            }
        }
    }

    fn on_accept_error(&self, e: io::Error) {
        {
            let mut core = lock(&self.inner.core);
            if matches!(core.state, ListenerState::Closed | ListenerState::Failed) {
                return;
            }
            core.state = ListenerState::Failed;
        }
        self.inner.cancel.cancel();
        self.inner.handler.on_error(NetError::io(e));
        self.inner.handler.on_closed();
    }

    fn release_one(&self) {
        let finished = {
            let mut core = lock(&self.inner.core);
            core.live = core.live.saturating_sub(1);
            let finished = core.live == 0 && core.state == ListenerState::Closing;
            if finished {
                core.state = ListenerState::Closed;
            }
            finished
        };

        if finished {
            debug!("last connection released, listener closed");
            self.inner.handler.on_closed();
        }
    }

    /// Stops accepting.
    ///
    /// When no accepted connection is live, [`ListenerHandler::on_closed`] runs
    /// before this returns; otherwise it runs once the last one is released.
    /// Closing again is a no-op.
    pub fn close(&self) {
        let finished = {
            let mut core = lock(&self.inner.core);
            match core.state {
                ListenerState::Idle => {
                    core.state = ListenerState::Closed;
                    true
                }
                ListenerState::Listening if core.live == 0 => {
                    core.state = ListenerState::Closed;
                    true
                }
                ListenerState::Listening => {
                    core.state = ListenerState::Closing;
                    false
                }
                ListenerState::Closing | ListenerState::Closed | ListenerState::Failed => return,
            }
        };

        self.inner.cancel.cancel();
        if finished {
            self.inner.handler.on_closed();
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.inner.core);
        f.debug_struct("Listener")
            .field("state", &core.state)
            .field("live", &core.live)
            .field("local_addr", &core.local_addr)
            .finish()
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
