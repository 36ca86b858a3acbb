//! A TCP connection driven by the scheduler.
//!
//! A [`Connection`] wraps one socket and walks it through the lifecycle encoded
//! in [`state`]. The owner observes the connection through a
//! [`ConnectionHandler`]; every notification runs on the scheduler thread.
//!
//! # Reading
//!
//! At most one OS read is outstanding. Each chunk is offered to
//! [`ConnectionHandler::on_data`] together with a [`Resume`] handle; the next
//! read is only issued once the handler accepted the chunk or fired the handle.
//! A zero-length read is the peer closing its side, reported through
//! [`ConnectionHandler::on_end`].
//!
//! # Writing
//!
//! [`Connection::write`] first tries a non-blocking write when nothing is
//! queued; whatever the kernel does not take is appended to the
//! [`OutputBuffer`] and flushed by the I/O driver. A write that carries a
//! [`Resume`] and can not complete synchronously returns [`Delivery::Deferred`]
//! and fires the handle once the buffer is empty again.

pub mod state;

pub use state::ConnectionState;

use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::buffer::OutputBuffer;
use crate::config::ConnectionOptions;
use crate::lock;
use crate::scheduler::SchedulerHandle;
use crate::stream::{Delivery, Resume};
use crate::NetError;
use state::{Effect, Event};

const READ_BUFFER_SIZE: usize = 8 * 1024;

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// Observes a [`Connection`].
///
/// Every method is invoked on the scheduler thread. Apart from
/// [`on_data`](Self::on_data), notifications are posted, so they never run
/// inside a call the owner made on the connection.
pub trait ConnectionHandler: Send + Sync {
    /// An outbound connect completed.
    fn on_connected(&self, _connection: &Connection) {}

    /// A chunk was read.
    ///
    /// Returning [`Delivery::Deferred`] keeps the read side paused until `resume`
    /// fires.
    fn on_data(&self, connection: &Connection, data: Bytes, resume: Resume) -> Delivery;

    /// The peer closed its write side.
    fn on_end(&self, connection: &Connection);

    /// A transport error occurred; [`on_closed`](Self::on_closed) follows.
    fn on_error(&self, connection: &Connection, error: NetError) {
        warn!(connection = %connection.id(), cause = %error, "connection error");
    }

    /// The connection is closed. Fires at most once.
    fn on_closed(&self, connection: &Connection);
}

/// Process-wide unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Core {
    state: ConnectionState,
    stream: Option<Arc<TcpStream>>,
    output: OutputBuffer,
    pending: Option<Resume>,
    flushing: bool,
    reading: bool,
    handler: Option<Arc<dyn ConnectionHandler>>,
    options: ConnectionOptions,
    remote: Option<SocketAddr>,
    on_release: Option<ReleaseHook>,
}

struct Inner {
    id: ConnectionId,
    scheduler: SchedulerHandle,
    cancel: CancellationToken,
    core: Mutex<Core>,
}

/// One TCP socket.
///
/// Cloning is cheap; every clone refers to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Creates an unconnected connection for use with [`connect`](Self::connect).
    pub fn new(scheduler: &SchedulerHandle, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::with_core(
            scheduler,
            Core {
                state: ConnectionState::NotConnected,
                stream: None,
                output: OutputBuffer::new(),
                pending: None,
                flushing: false,
                reading: false,
                handler: Some(handler),
                options: ConnectionOptions::default(),
                remote: None,
                on_release: None,
            },
        )
    }

    /// Wraps a socket returned by `accept`.
    ///
    /// No read is issued until a handler is [attached](Self::attach). The release
    /// hook runs once, when the connection closes or is disposed.
    pub(crate) fn accepted(
        scheduler: &SchedulerHandle,
        stream: TcpStream,
        options: ConnectionOptions,
        on_release: ReleaseHook,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(options.nodelay) {
            debug!(cause = %e, "failed to set TCP_NODELAY");
        }
        let remote = stream.peer_addr().ok();

        Self::with_core(
            scheduler,
            Core {
                state: ConnectionState::Connected,
                stream: Some(Arc::new(stream)),
                output: OutputBuffer::new(),
                pending: None,
                flushing: false,
                reading: false,
                handler: None,
                options,
                remote,
                on_release: Some(on_release),
            },
        )
    }

    fn with_core(scheduler: &SchedulerHandle, core: Core) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ConnectionId::next(),
                scheduler: scheduler.clone(),
                cancel: CancellationToken::new(),
                core: Mutex::new(core),
            }),
        }
    }

    /// Installs the handler of an accepted connection and starts reading.
    pub(crate) fn attach(&self, handler: Arc<dyn ConnectionHandler>) {
        lock(&self.inner.core).handler = Some(handler);
        self.issue_read();
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.core).state
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.core).remote
    }

    /// Number of bytes accepted by [`write`](Self::write) but not yet flushed.
    pub fn buffered(&self) -> usize {
        lock(&self.inner.core).output.len()
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    /// Starts connecting to `addr`.
    ///
    /// On success the handler receives [`on_connected`](ConnectionHandler::on_connected)
    /// and reading starts; on failure it receives an error followed by closed.
    pub fn connect(&self, addr: SocketAddr) -> Result<(), NetError> {
        {
            let mut core = lock(&self.inner.core);
            if core.state == ConnectionState::NotConnected {
                core.remote = Some(addr);
            }
        }
        self.apply(Event::Connect, None)
    }

    /// Queues `data` for writing.
    ///
    /// Returns [`Delivery::Accepted`] when the bytes were written synchronously
    /// or no continuation was supplied, and [`Delivery::Deferred`] when `resume`
    /// will fire once the queued output is flushed. Only one such continuation
    /// may be outstanding; writes without one are always appended. Transport
    /// failures are not returned here; they surface through
    /// [`ConnectionHandler::on_error`].
    pub fn write(&self, mut data: Bytes, resume: Option<Resume>) -> Result<Delivery, NetError> {
        let mut core = lock(&self.inner.core);
        match core.state {
            state if state.is_writable() => {}
            ConnectionState::Disposed => return Err(NetError::Disposed),
            state => return Err(NetError::invalid_state("write", state)),
        }
        if resume.is_some() && core.pending.is_some() {
            return Err(NetError::WritePending);
        }
        if data.is_empty() {
            return Ok(Delivery::Accepted);
        }

        if core.output.is_empty() && !core.flushing {
            if let Some(stream) = &core.stream {
                match stream.try_write(&data) {
                    Ok(n) if n == data.len() => return Ok(Delivery::Accepted),
                    Ok(n) => data.advance(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        drop(core);
                        self.fail(e);
                        return Ok(Delivery::Accepted);
                    }
                }
            }
        }

        core.output.push(data);
        let delivery = match resume {
            Some(resume) => {
                core.pending = Some(resume);
                Delivery::Deferred
            }
            None => Delivery::Accepted,
        };
        let start_flush = !core.flushing && core.stream.is_some();
        core.flushing |= start_flush;
        drop(core);

        if start_flush {
            self.flush();
        }
        Ok(delivery)
    }

    /// Half-closes the write side once queued output is flushed.
    pub fn end(&self) -> Result<(), NetError> {
        self.apply(Event::End, None)
    }

    /// Releases the socket. Safe to call in any state, any number of times.
    pub fn dispose(&self) {
        self.signal(Event::Dispose, None);
    }

    fn apply(&self, event: Event, error: Option<io::Error>) -> Result<(), NetError> {
        let (effects, stream, handler, remote, release) = {
            let mut core = lock(&self.inner.core);
            let (next, effects) = state::transition(core.state, event, core.output.is_empty())?;
            if next != core.state {
                trace!(connection = %self.inner.id, from = ?core.state, to = ?next, ?event, "connection state changed");
            }
            core.state = next;

            let stream = core.stream.clone();
            let handler = core.handler.clone();
            let mut release = None;
            for effect in effects {
                match effect {
                    Effect::DiscardOutput => {
                        core.output.clear();
                        if let Some(pending) = core.pending.take() {
                            pending.disarm();
                        }
                    }
                    Effect::RaiseClosed => release = core.on_release.take(),
                    Effect::Release => {
                        core.stream = None;
                        core.handler = None;
                        release = release.or_else(|| core.on_release.take());
                    }
                    _ => {}
                }
            }
            (effects, stream, handler, core.remote, release)
        };

        let mut error = error;
        let mut release = release;
        for effect in effects {
            match effect {
                Effect::BeginConnect => {
                    if let Some(addr) = remote {
                        self.begin_connect(addr);
                    }
                }
                Effect::StartReading => self.issue_read(),
                Effect::ShutdownWrite => shutdown(stream.as_deref(), Shutdown::Write),
                Effect::ShutdownBoth => shutdown(stream.as_deref(), Shutdown::Both),
                Effect::DiscardOutput => {}
                Effect::RaiseConnected => self.raise(&handler, |h, c| h.on_connected(c)),
                Effect::RaiseReadEnded => self.raise(&handler, |h, c| h.on_end(c)),
                Effect::RaiseError => {
                    let error = error.take().map_or_else(
                        || NetError::io(io::Error::other("connection failed")),
                        NetError::io,
                    );
                    self.raise(&handler, move |h, c| h.on_error(c, error));
                }
                Effect::RaiseClosed => {
                    let handler = handler.clone();
                    let hook = release.take();
                    let connection = self.clone();
                    self.inner.scheduler.post(move || {
                        if let Some(handler) = handler {
                            handler.on_closed(&connection);
                        }
                        if let Some(hook) = hook {
                            hook();
                        }
                    });
                }
                Effect::Release => {
                    self.inner.cancel.cancel();
                    if let Some(hook) = release.take() {
                        self.inner.scheduler.post(hook);
                    }
                    debug!(connection = %self.inner.id, "connection released");
                }
            }
        }
        Ok(())
    }

    /// Applies an I/O completion; those are never invalid, only ignored.
    fn signal(&self, event: Event, error: Option<io::Error>) {
        if let Err(e) = self.apply(event, error) {
            trace!(connection = %self.inner.id, cause = %e, ?event, "ignored connection event");
        }
    }

    fn raise<F>(&self, handler: &Option<Arc<dyn ConnectionHandler>>, notify: F)
    where
        F: FnOnce(&dyn ConnectionHandler, &Connection) + Send + 'static,
    {
        let Some(handler) = handler.clone() else {
            return;
        };
        let connection = self.clone();
        self.inner.scheduler.post(move || notify(handler.as_ref(), &connection));
    }

    fn fail(&self, error: io::Error) {
        if is_reset(&error) {
            debug!(connection = %self.inner.id, cause = %error, "connection reset by peer");
            self.signal(Event::Reset, None);
        } else {
            self.signal(Event::Fault, Some(error));
        }
    }

    fn begin_connect(&self, addr: SocketAddr) {
        let connection = self.clone();
        let token = self.inner.cancel.clone();
        self.inner.scheduler.spawn_io(async move {
            let outcome = select! {
                () = token.cancelled() => return,
                outcome = TcpStream::connect(addr) => outcome,
            };
            let scheduler = connection.inner.scheduler.clone();
            scheduler.post(move || connection.on_connect(outcome));
        });
    }

    fn on_connect(&self, outcome: io::Result<TcpStream>) {
        match outcome {
            Ok(stream) => {
                {
                    let mut core = lock(&self.inner.core);
                    if core.state != ConnectionState::Connecting {
                        return;
                    }
                    if let Err(e) = stream.set_nodelay(core.options.nodelay) {
                        debug!(cause = %e, "failed to set TCP_NODELAY");
                    }
                    core.stream = Some(Arc::new(stream));
                }
                self.signal(Event::ConnectSucceeded, None);
            }
            Err(e) => {
                debug!(connection = %self.inner.id, cause = %e, "connect failed");
                self.signal(Event::ConnectFailed, Some(e));
            }
        }
    }

    fn issue_read(&self) {
        let (stream, timeout) = {
            let mut core = lock(&self.inner.core);
            if !core.state.is_readable() || core.reading {
                return;
            }
            let Some(stream) = core.stream.clone() else {
                return;
            };
            core.reading = true;
            (stream, core.options.read_timeout)
        };

        let connection = self.clone();
        let token = self.inner.cancel.clone();
        self.inner.scheduler.spawn_io(async move {
            let outcome = select! {
                () = token.cancelled() => return,
                outcome = read_chunk(&stream, timeout) => outcome,
            };
            let scheduler = connection.inner.scheduler.clone();
            scheduler.post(move || connection.on_read(outcome));
        });
    }

    fn on_read(&self, outcome: io::Result<Bytes>) {
        let handler = {
            let mut core = lock(&self.inner.core);
            core.reading = false;
            if !core.state.is_readable() {
                return;
            }
            core.handler.clone()
        };

        match outcome {
            Ok(data) if data.is_empty() => self.signal(Event::PeerClosed, None),
            Ok(data) => {
                let Some(handler) = handler else {
                    return;
                };
                trace!(connection = %self.inner.id, size = data.len(), "read chunk");
                let connection = self.clone();
                let resume = Resume::posted(&self.inner.scheduler, move || connection.issue_read());
                let delivery = handler.on_data(self, data, resume.clone());
                if delivery == Delivery::Accepted && resume.disarm() {
                    self.issue_read();
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn flush(&self) {
        let (stream, segments, timeout) = {
            let mut core = lock(&self.inner.core);
            let stream = match &core.stream {
                Some(stream) if core.state.is_open() && !core.output.is_empty() => Arc::clone(stream),
                _ => {
                    core.flushing = false;
                    return;
                }
            };
            trace!(
                connection = %self.inner.id,
                bytes = core.output.len(),
                segments = core.output.segment_count(),
                "flushing output"
            );
            (stream, core.output.snapshot(), core.options.write_timeout)
        };

        let connection = self.clone();
        let token = self.inner.cancel.clone();
        self.inner.scheduler.spawn_io(async move {
            let outcome = select! {
                () = token.cancelled() => return,
                outcome = write_segments(&stream, &segments, timeout) => outcome,
            };
            let scheduler = connection.inner.scheduler.clone();
            scheduler.post(move || connection.on_flushed(outcome));
        });
    }

    fn on_flushed(&self, outcome: io::Result<usize>) {
        let written = match outcome {
            Ok(written) => written,
            Err(e) => {
                lock(&self.inner.core).flushing = false;
                self.fail(e);
                return;
            }
        };

        let drained = {
            let mut core = lock(&self.inner.core);
            core.output.advance(written);
            if core.output.is_empty() {
                core.flushing = false;
                Some(core.pending.take())
            } else {
                None
            }
        };

        match drained {
            None => self.flush(),
            Some(pending) => {
                trace!(connection = %self.inner.id, "output drained");
                self.signal(Event::Drained, None);
                if let Some(pending) = pending {
                    pending.resume();
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.inner.core);
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("buffered", &core.output.len())
            .field("remote", &core.remote)
            .finish()
    }
}

fn shutdown(stream: Option<&TcpStream>, how: Shutdown) {
    let Some(stream) = stream else {
        return;
    };
    if let Err(e) = SockRef::from(stream).shutdown(how) {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(cause = %e, ?how, "socket shutdown failed");
        }
    }
}

fn is_reset(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
    )
}

async fn with_timeout<F, T>(timeout: Option<Duration>, operation: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout {
        None => operation.await,
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(outcome) => outcome,
            Err(elapsed) => Err(io::Error::new(io::ErrorKind::TimedOut, elapsed)),
        },
    }
}

async fn read_chunk(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<Bytes> {
    with_timeout(timeout, async {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        loop {
            stream.readable().await?;
            match stream.try_read_buf(&mut buf) {
                Ok(_) => return Ok(buf.freeze()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
    })
    .await
}

async fn write_segments(stream: &TcpStream, segments: &[Bytes], timeout: Option<Duration>) -> io::Result<usize> {
    with_timeout(timeout, async {
        let mut written = 0;
        for segment in segments {
            let mut rest = segment.as_ref();
            while !rest.is_empty() {
                stream.writable().await?;
                match stream.try_write(rest) {
                    Ok(n) => {
                        rest = &rest[n..];
                        written += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(written)
    })
    .await
}
