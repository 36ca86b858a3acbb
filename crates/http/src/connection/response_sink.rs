use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use http::header::CONTENT_LENGTH;
use http::{HeaderValue, Response};
use http_body::Body;
use strand_net::{BoxError, Connection, ConnectionId, DataProducer, SchedulerHandle, lock};

use crate::body::BodyProducer;
use crate::connection::session::HttpSession;
use crate::protocol::{HttpError, RequestHead, ResponseHead, SendError};
use crate::utils::ensure;

#[derive(Debug, Default)]
struct SinkState {
    continue_sent: bool,
    head_sent: bool,
    ended: bool,
}

struct SinkInner {
    session: Weak<HttpSession>,
    scheduler: SchedulerHandle,
    transaction: u64,
    connection: ConnectionId,
    keep_alive: bool,
    expects_continue: bool,
    state: Mutex<SinkState>,
}

/// Writes the response of one transaction.
///
/// The calls are checked right away and then carried out in order on the
/// scheduler thread, so a sink can be used from any thread. A response is
/// [`respond`](Self::respond), then any number of
/// [`write_body`](Self::write_body), then [`end`](Self::end); the bytes reach
/// the wire only once every earlier response on the connection is written.
#[derive(Clone)]
pub struct ResponseSink {
    inner: Arc<SinkInner>,
}

impl ResponseSink {
    pub(crate) fn new(
        session: Weak<HttpSession>,
        connection: &Connection,
        transaction: u64,
        request: &RequestHead,
        keep_alive: bool,
    ) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                session,
                scheduler: connection.scheduler().clone(),
                transaction,
                connection: connection.id(),
                keep_alive,
                expects_continue: request.expects_continue(),
                state: Mutex::new(SinkState::default()),
            }),
        }
    }

    /// Writes the interim `100 Continue` status.
    pub fn write_continue(&self) -> Result<(), SendError> {
        {
            let mut state = lock(&self.inner.state);
            ensure!(!state.continue_sent, SendError::ContinueAlreadySent);
            ensure!(!state.head_sent, SendError::HeadAlreadySent);
            state.continue_sent = true;
        }
        self.post(HttpSession::write_continue);
        Ok(())
    }

    /// Sets the response head.
    ///
    /// It is rendered right before the first body byte, or on [`end`](Self::end)
    /// when there is no body. A `Content-Length` in `head` selects length
    /// framing; otherwise the body is chunked for HTTP/1.1 and delimited by
    /// closing the connection for HTTP/1.0.
    pub fn respond(&self, head: ResponseHead) -> Result<(), SendError> {
        {
            let mut state = lock(&self.inner.state);
            ensure!(!state.ended, SendError::AlreadyEnded);
            ensure!(!state.head_sent, SendError::HeadAlreadySent);
            state.head_sent = true;
        }
        self.post(move |session, id| session.set_head(id, head));
        Ok(())
    }

    /// Appends a body source. Sources are drained one after the other, in the
    /// order they were added.
    pub fn write_body<P>(&self, producer: P) -> Result<(), SendError>
    where
        P: DataProducer + 'static,
    {
        self.check_writable()?;
        let producer: Box<dyn DataProducer> = Box::new(producer);
        self.post(move |session, id| session.push_producer(id, producer));
        Ok(())
    }

    /// Completes the response once every body source has ended.
    pub fn end(&self) -> Result<(), SendError> {
        {
            let mut state = lock(&self.inner.state);
            ensure!(!state.ended, SendError::AlreadyEnded);
            ensure!(state.head_sent, SendError::HeadNotSent);
            state.ended = true;
        }
        self.post(HttpSession::end_response);
        Ok(())
    }

    /// Sends a complete response.
    ///
    /// A body with an exact size hint is sent with `Content-Length` unless the
    /// response already carries one.
    pub fn send<B>(&self, response: Response<B>) -> Result<(), SendError>
    where
        B: Body + Send + Unpin + 'static,
        B::Data: Send,
        B::Error: Into<BoxError> + Send,
    {
        let (parts, body) = response.into_parts();
        let mut head = Response::from_parts(parts, ());
        let exact = body.size_hint().exact();
        if let Some(length) = exact {
            head.headers_mut().entry(CONTENT_LENGTH).or_insert_with(|| HeaderValue::from(length));
        }

        self.respond(head)?;
        if exact != Some(0) {
            self.write_body(BodyProducer::new(&self.inner.scheduler, body))?;
        }
        self.end()
    }

    /// Gives up on the response.
    ///
    /// Sends `500 Internal Server Error` if the head is not written yet and cuts
    /// the body short otherwise; the connection closes after this transaction
    /// and the observer receives the error.
    pub fn abort<S: ToString>(&self, reason: S) {
        lock(&self.inner.state).ended = true;
        let error = HttpError::handler(reason);
        self.post(move |session, id| session.abort_transaction(id, error));
    }

    /// Whether the request asked to keep the connection open.
    pub fn should_keep_alive(&self) -> bool {
        self.inner.keep_alive
    }

    /// Whether the request carries `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.inner.expects_continue
    }

    pub fn transaction_id(&self) -> u64 {
        self.inner.transaction
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.connection
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.inner.scheduler
    }

    fn check_writable(&self) -> Result<(), SendError> {
        let state = lock(&self.inner.state);
        ensure!(!state.ended, SendError::AlreadyEnded);
        ensure!(state.head_sent, SendError::HeadNotSent);
        Ok(())
    }

    fn post<F>(&self, op: F)
    where
        F: FnOnce(&HttpSession, u64) + Send + 'static,
    {
        let session = Weak::clone(&self.inner.session);
        let id = self.inner.transaction;
        self.inner.scheduler.post(move || {
            if let Some(session) = session.upgrade() {
                op(&session, id);
            }
        });
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("connection", &self.inner.connection)
            .field("transaction", &self.inner.transaction)
            .field("state", &*lock(&self.inner.state))
            .finish_non_exhaustive()
    }
}
