//! The HTTP server facade: listeners bound to the connection pipelines.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use http::HeaderValue;
use strand_net::{
    Connection, ConnectionHandler, ConnectionId, Listener, ListenerConfig, ListenerHandler, NetError, SchedulerHandle,
    lock,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::connection::{HeadDefaults, HttpSession, ResponseSink};
use crate::date::DateCache;
use crate::handler::RequestHandler;
use crate::protocol::HttpError;

const DEFAULT_SERVER_NAME: &str = "strand";

/// Follows the transactions of each connection.
///
/// [`on_next`](Self::on_next) fires once per transaction. After that, every
/// connection ends with exactly one of [`on_error`](Self::on_error), for the
/// first error it ran into, or [`on_completed`](Self::on_completed), once it
/// closed without one.
pub trait TransactionObserver: Send + Sync {
    fn on_next(&self, _connection: ConnectionId, _response: &ResponseSink) {}

    fn on_error(&self, connection: ConnectionId, error: &HttpError) {
        warn!(connection = %connection, cause = %error, "http connection failed");
    }

    fn on_completed(&self, _connection: ConnectionId) {}
}

#[derive(Debug)]
struct LogObserver;

impl TransactionObserver for LogObserver {}

type ClosedCallback = Box<dyn FnOnce() + Send>;

/// State shared by the listeners and sessions of one server.
pub(crate) struct ServerShared {
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) observer: Arc<dyn TransactionObserver>,
    server_name: HeaderValue,
    date: DateCache,
    closing: AtomicBool,
    sessions: Mutex<HashMap<ConnectionId, Weak<HttpSession>>>,
    open_listeners: AtomicUsize,
    on_closed: Mutex<Option<ClosedCallback>>,
}

impl ServerShared {
    pub(crate) fn head_defaults(&self) -> HeadDefaults {
        HeadDefaults { server: self.server_name.clone(), date: self.date.value() }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn unregister(&self, connection: ConnectionId) {
        lock(&self.sessions).remove(&connection);
    }

    fn register(&self, connection: ConnectionId, session: &Arc<HttpSession>) {
        lock(&self.sessions).insert(connection, Arc::downgrade(session));
    }

    fn live_sessions(&self) -> Vec<Arc<HttpSession>> {
        lock(&self.sessions).values().filter_map(Weak::upgrade).collect()
    }

    fn listener_closed(&self) {
        if self.open_listeners.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        info!("http server closed");
        let callback = lock(&self.on_closed).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Hands accepted connections to new sessions.
struct Acceptor {
    shared: Arc<ServerShared>,
}

impl ListenerHandler for Acceptor {
    fn on_connection(&self, connection: &Connection) -> Option<Arc<dyn ConnectionHandler>> {
        if self.shared.is_closing() {
            debug!(connection = %connection.id(), "server is closing, declining connection");
            return None;
        }

        trace!(connection = %connection.id(), peer = ?connection.peer_addr(), "accepted connection");
        let session = HttpSession::new(connection, Arc::clone(&self.shared));
        self.shared.register(connection.id(), &session);
        Some(session)
    }

    fn on_closed(&self) {
        self.shared.listener_closed();
    }
}

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("request handler must be set")]
    MissingHandler,

    #[error("address must be set")]
    MissingAddress,

    #[error("failed to resolve address: {source}")]
    Resolve {
        #[from]
        source: io::Error,
    },

    #[error("invalid server name")]
    InvalidServerName,

    #[error("failed to listen on {address}: {source}")]
    Listen { address: SocketAddr, source: NetError },
}

pub struct ServerBuilder {
    addresses: Vec<SocketAddr>,
    resolve_error: Option<io::Error>,
    handler: Option<Arc<dyn RequestHandler>>,
    observer: Option<Arc<dyn TransactionObserver>>,
    server_name: Option<String>,
    listener_config: ListenerConfig,
    on_closed: Option<ClosedCallback>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            addresses: Vec::new(),
            resolve_error: None,
            handler: None,
            observer: None,
            server_name: None,
            listener_config: ListenerConfig::default(),
            on_closed: None,
        }
    }

    /// Adds address(es) to listen on; may be called more than once.
    #[must_use]
    pub fn address<A: ToSocketAddrs>(mut self, address: A) -> Self {
        match address.to_socket_addrs() {
            Ok(resolved) => self.addresses.extend(resolved),
            Err(e) => self.resolve_error = Some(e),
        }
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: impl TransactionObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Value of the `Server` header added to responses that do not set one.
    #[must_use]
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn listener_config(mut self, config: ListenerConfig) -> Self {
        self.listener_config = config;
        self
    }

    /// Called once on the scheduler thread after [`HttpServer::close`], when
    /// the last connection is gone.
    #[must_use]
    pub fn on_closed<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_closed = Some(Box::new(callback));
        self
    }

    /// Binds every address and starts accepting on `scheduler`.
    pub fn build(self, scheduler: &SchedulerHandle) -> Result<HttpServer, ServerBuildError> {
        if let Some(e) = self.resolve_error {
            return Err(e.into());
        }
        let handler = self.handler.ok_or(ServerBuildError::MissingHandler)?;
        if self.addresses.is_empty() {
            return Err(ServerBuildError::MissingAddress);
        }
        let server_name = match self.server_name {
            Some(name) => HeaderValue::try_from(name).map_err(|_invalid| ServerBuildError::InvalidServerName)?,
            None => HeaderValue::from_static(DEFAULT_SERVER_NAME),
        };

        let shared = Arc::new(ServerShared {
            handler,
            observer: self.observer.unwrap_or_else(|| Arc::new(LogObserver)),
            server_name,
            date: DateCache::new(),
            closing: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            open_listeners: AtomicUsize::new(self.addresses.len()),
            on_closed: Mutex::new(None),
        });

        let mut listeners = Vec::with_capacity(self.addresses.len());
        let mut local_addrs = Vec::with_capacity(self.addresses.len());
        for address in self.addresses {
            let acceptor = Arc::new(Acceptor { shared: Arc::clone(&shared) });
            let listener = Listener::new(scheduler, acceptor, self.listener_config.clone());
            match listener.listen(address) {
                Ok(local) => {
                    info!(address = %local, "http server listening");
                    local_addrs.push(local);
                    listeners.push(listener);
                }
                Err(source) => {
                    shared.closing.store(true, Ordering::Release);
                    listener.close();
                    for listener in &listeners {
                        listener.close();
                    }
                    return Err(ServerBuildError::Listen { address, source });
                }
            }
        }

        *lock(&shared.on_closed) = self.on_closed;
        Ok(HttpServer { shared, listeners, local_addrs, scheduler: scheduler.clone() })
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("addresses", &self.addresses)
            .field("server_name", &self.server_name)
            .field("listener_config", &self.listener_config)
            .finish_non_exhaustive()
    }
}

/// A running HTTP server.
pub struct HttpServer {
    shared: Arc<ServerShared>,
    listeners: Vec<Listener>,
    local_addrs: Vec<SocketAddr>,
    scheduler: SchedulerHandle,
}

impl HttpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The bound addresses, in the order they were given to the builder.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addrs.first().copied()
    }

    pub fn live_connections(&self) -> usize {
        self.listeners.iter().map(Listener::live_connections).sum()
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }

    /// Stops accepting and closes the server gracefully.
    ///
    /// Idle connections are ended right away; connections with transactions in
    /// flight are ended once their responses are written. The closed callback
    /// fires when the last connection is gone. Closing again is a no-op.
    pub fn close(&self) {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(connections = self.live_connections(), "closing http server");

        let listeners = self.listeners.clone();
        let shared = Arc::clone(&self.shared);
        self.scheduler.post(move || {
            for listener in &listeners {
                listener.close();
            }
            for session in shared.live_sessions() {
                session.shutdown();
            }
        });
    }
}

impl fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addrs", &self.local_addrs)
            .field("closing", &self.is_closing())
            .finish_non_exhaustive()
    }
}
