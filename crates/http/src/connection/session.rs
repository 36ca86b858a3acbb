//! One HTTP connection: the transaction pipeline and the response pipeline.
//!
//! Incoming bytes go through the [`WireParser`]; the committed events open
//! transactions, each with a [`ResponseSlot`] queued in request order and a
//! [`BodyChannel`] for the request body. Output is produced by [`pump`]: only
//! the front slot writes, its producers are connected one at a time, and the
//! next slot starts only after the front slot finished. When the socket pushes
//! back, producer continuations are parked until the output buffer drains.
//!
//! Everything here runs on the scheduler thread. The session lock is never held
//! while a handler, producer or consumer is called.
//!
//! [`pump`]: HttpSession::pump

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::StatusCode;
use strand_net::{
    BoxError, Connection, ConnectionHandler, DataConsumer, DataProducer, Delivery, NetError, Resume, WorkPanic, lock,
};
use tracing::{debug, error, trace, warn};

use crate::body::{BodyChannel, RequestBody};
use crate::connection::response_queue::{HeadDefaults, ResponseQueue, ResponseSlot, SlotAction};
use crate::connection::ResponseSink;
use crate::protocol::{HttpError, ParseError, RequestHead, ResponseHead};
use crate::server::ServerShared;
use crate::wire::{TransactionDelegate, WireParser};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Default)]
struct SessionCore {
    parser: WireParser,
    responses: ResponseQueue,
    /// Body of the request currently being received
    current_body: Option<BodyChannel>,
    next_transaction: u64,
    /// No transaction after the queued ones; end once they are written.
    closing: bool,
    peer_closed: bool,
    ended: bool,
    closed: bool,
    /// The observer got its terminal notification.
    notified: bool,
    write_blocked: bool,
    /// Producer continuations waiting for the output buffer to drain
    stalled: Vec<Resume>,
    pumping: bool,
}

enum Step {
    Write(Bytes),
    Connect(u64, Box<dyn DataProducer>),
    Finished(Finished),
    End,
    Idle,
}

struct Finished {
    output: Bytes,
    request_body: Option<BodyChannel>,
    dropped: Vec<ResponseSlot>,
    error: Option<HttpError>,
}

pub(crate) struct HttpSession {
    this: Weak<HttpSession>,
    connection: Connection,
    shared: Arc<ServerShared>,
    core: Mutex<SessionCore>,
}

impl HttpSession {
    pub(crate) fn new(connection: &Connection, shared: Arc<ServerShared>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: Weak::clone(this),
            connection: connection.clone(),
            shared,
            core: Mutex::new(SessionCore::default()),
        })
    }

    /// Stops taking new transactions; the connection ends once the queued
    /// responses are written, right away if there are none.
    pub(crate) fn shutdown(&self) {
        {
            let mut core = lock(&self.core);
            core.closing = true;
            if core.parser.is_idle() {
                core.parser.stop();
            }
        }
        self.pump();
    }

    pub(crate) fn write_continue(&self, id: u64) {
        self.update_slot(id, ResponseSlot::request_continue);
    }

    pub(crate) fn set_head(&self, id: u64, head: ResponseHead) {
        self.update_slot(id, |slot| slot.set_head(head));
    }

    pub(crate) fn push_producer(&self, id: u64, producer: Box<dyn DataProducer>) {
        let rejected = {
            let mut core = lock(&self.core);
            match core.responses.find_mut(id) {
                Some(slot) => slot.push_producer(producer),
                None => Some(producer),
            }
        };
        if rejected.is_some() {
            trace!(connection = %self.connection.id(), transaction = id, "dropping producer of a finished response");
        }
        drop(rejected);
        self.pump();
    }

    pub(crate) fn end_response(&self, id: u64) {
        self.update_slot(id, ResponseSlot::request_end);
    }

    /// Gives up on a transaction's response: `500` if its head is not out yet,
    /// a truncated body otherwise. The connection closes after it.
    pub(crate) fn abort_transaction(&self, id: u64, error: HttpError) {
        let subscription = {
            let mut core = lock(&self.core);
            match core.responses.find_mut(id) {
                Some(slot) if !slot.is_aborted() => slot.abort(StatusCode::INTERNAL_SERVER_ERROR),
                _ => return,
            }
        };
        if let Some(subscription) = subscription {
            subscription.cancel();
        }

        error!(connection = %self.connection.id(), transaction = id, cause = %error, "aborting response");
        self.report(error);
        self.pump();
    }

    fn update_slot<F>(&self, id: u64, f: F)
    where
        F: FnOnce(&mut ResponseSlot),
    {
        {
            let mut core = lock(&self.core);
            if let Some(slot) = core.responses.find_mut(id) {
                f(slot);
            }
        }
        self.pump();
    }

    /// Advances the front slot as far as it can go.
    ///
    /// Producers may call back into the session while being connected; such a
    /// nested call returns immediately and the running loop picks up its effect.
    fn pump(&self) {
        {
            let mut core = lock(&self.core);
            if core.pumping {
                return;
            }
            core.pumping = true;
        }

        let defaults = self.shared.head_defaults();
        loop {
            let step = {
                let mut core = lock(&self.core);
                let step = next_step(&mut core, &defaults);
                if matches!(step, Step::Idle) {
                    core.pumping = false;
                }
                step
            };

            match step {
                Step::Idle => return,
                Step::Write(output) => {
                    let _ignored = self.write_output(output, None);
                }
                Step::Connect(id, producer) => self.connect_producer(id, producer),
                Step::Finished(finished) => self.complete(finished),
                Step::End => self.end_connection(),
            }
        }
    }

    fn connect_producer(&self, id: u64, producer: Box<dyn DataProducer>) {
        trace!(connection = %self.connection.id(), transaction = id, "connecting body producer");
        let consumer = SlotConsumer { session: Weak::clone(&self.this), id };
        let subscription = producer.connect(Box::new(consumer));

        let rejected = {
            let mut core = lock(&self.core);
            match core.responses.front_mut() {
                Some(slot) if slot.id() == id => slot.attach_subscription(subscription),
                _ => Some(subscription),
            }
        };
        if let Some(subscription) = rejected {
            subscription.cancel();
        }
    }

    fn complete(&self, finished: Finished) {
        let Finished { output, request_body, dropped, error } = finished;
        let _ignored = self.write_output(output, None);

        if let Some(body) = request_body.filter(|body| !body.is_claimed()) {
            trace!(connection = %self.connection.id(), "discarding unread request body");
            body.cancel();
        }
        for slot in dropped {
            release(slot, "connection is closing");
        }
        if let Some(error) = error {
            self.report(error);
        }
    }

    fn end_connection(&self) {
        debug!(connection = %self.connection.id(), "ending connection");
        if let Err(e) = self.connection.end() {
            debug!(connection = %self.connection.id(), cause = %e, "connection already ending");
        }
    }

    /// Hands encoded output to the connection.
    ///
    /// While the connection reports backpressure, `resume` is parked and fired
    /// once the output buffer drained.
    fn write_output(&self, output: Bytes, resume: Option<Resume>) -> Delivery {
        if output.is_empty() {
            return Delivery::Accepted;
        }

        let blocked = lock(&self.core).write_blocked;
        let drained = if blocked {
            None
        } else {
            let session = Weak::clone(&self.this);
            Some(Resume::posted(self.connection.scheduler(), move || {
                if let Some(session) = session.upgrade() {
                    session.output_drained();
                }
            }))
        };

        match self.connection.write(output, drained) {
            Ok(Delivery::Accepted) if !blocked => Delivery::Accepted,
            Ok(_) => {
                let mut core = lock(&self.core);
                core.write_blocked = true;
                match resume {
                    Some(resume) => {
                        core.stalled.push(resume);
                        Delivery::Deferred
                    }
                    None => Delivery::Accepted,
                }
            }
            Err(e) => {
                debug!(connection = %self.connection.id(), cause = %e, "dropping response output");
                Delivery::Accepted
            }
        }
    }

    fn output_drained(&self) {
        let stalled = {
            let mut core = lock(&self.core);
            core.write_blocked = false;
            mem::take(&mut core.stalled)
        };
        for resume in stalled {
            resume.resume();
        }
        self.pump();
    }

    fn on_body_data(&self, id: u64, data: Bytes, resume: Option<Resume>) -> Delivery {
        let defaults = self.shared.head_defaults();
        let encoded = {
            let mut core = lock(&self.core);
            match core.responses.front_mut() {
                Some(slot) if slot.id() == id && !slot.is_aborted() => slot.encode_data(data, &defaults),
                _ => return Delivery::Accepted,
            }
        };

        match encoded {
            Ok(output) => self.write_output(output, resume),
            Err(e) => {
                self.abort_transaction(id, e.into());
                Delivery::Accepted
            }
        }
    }

    fn on_producer_end(&self, id: u64) {
        {
            let mut core = lock(&self.core);
            if let Some(slot) = core.responses.front_mut().filter(|slot| slot.id() == id) {
                slot.producer_ended();
            }
        }
        self.pump();
    }

    /// Answers a malformed request with an error status behind the pending
    /// responses, then closes.
    fn reject_request(&self, error: ParseError) {
        warn!(connection = %self.connection.id(), cause = %error, "malformed request");
        let body = {
            let mut core = lock(&self.core);
            core.next_transaction += 1;
            let id = core.next_transaction;
            core.responses.push(ResponseSlot::error(id, error.status()));
            core.current_body.take()
        };
        if let Some(body) = body {
            body.fail(error.to_string().into());
        }
        self.report(error.into());
        self.pump();
    }

    /// Passes the first error of this connection to the observer.
    fn report(&self, error: HttpError) {
        {
            let mut core = lock(&self.core);
            if core.notified {
                debug!(connection = %self.connection.id(), cause = %error, "suppressing further connection error");
                return;
            }
            core.notified = true;
        }
        self.shared.observer.on_error(self.connection.id(), &error);
    }
}

fn next_step(core: &mut SessionCore, defaults: &HeadDefaults) -> Step {
    if core.closed || core.ended || core.write_blocked {
        return Step::Idle;
    }

    let Some(slot) = core.responses.front_mut() else {
        if core.closing || core.peer_closed {
            core.ended = true;
            core.parser.stop();
            return Step::End;
        }
        return Step::Idle;
    };

    match slot.next_action() {
        SlotAction::Continue => Step::Write(Bytes::from_static(CONTINUE)),
        SlotAction::Connect(producer) => Step::Connect(slot.id(), producer),
        SlotAction::Wait => Step::Idle,
        SlotAction::Finish => {
            let (output, error) = slot.finish(defaults);
            let error = error.map(HttpError::from);
            let keep_alive = slot.keep_alive() && error.is_none();
            let request_body = slot.take_request_body();
            let _finished = core.responses.pop_front();

            let dropped = if keep_alive {
                Vec::new()
            } else {
                core.closing = true;
                core.responses.drain().collect()
            };
            Step::Finished(Finished { output, request_body, dropped, error })
        }
    }
}

/// Releases what a slot still holds when its response will never be written.
fn release(slot: ResponseSlot, reason: &str) {
    let (subscription, body) = slot.discard();
    if let Some(subscription) = subscription {
        subscription.cancel();
    }
    if let Some(body) = body {
        body.fail(reason.into());
    }
}

impl TransactionDelegate for HttpSession {
    fn on_request(&self, head: RequestHead, keep_alive: bool) {
        let channel = BodyChannel::new();
        let (id, keep_alive) = {
            let mut core = lock(&self.core);
            let keep_alive = keep_alive && !self.shared.is_closing();
            core.next_transaction += 1;
            let id = core.next_transaction;
            core.responses.push(ResponseSlot::new(id, &head, keep_alive, channel.clone()));
            core.current_body = Some(channel.clone());
            (id, keep_alive)
        };
        debug!(
            connection = %self.connection.id(),
            transaction = id,
            method = %head.method(),
            uri = %head.uri(),
            keep_alive,
            "request"
        );

        let sink = ResponseSink::new(Weak::clone(&self.this), &self.connection, id, &head, keep_alive);
        self.shared.observer.on_next(self.connection.id(), &sink);

        let body = RequestBody::new(channel, self.connection.scheduler());
        let handler = Arc::clone(&self.shared.handler);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler.on_request(head, body, sink))) {
            let panic = WorkPanic::from_payload(payload.as_ref());
            self.abort_transaction(id, HttpError::handler(panic.message()));
        }
    }

    fn on_request_data(&self, data: Bytes, resume: Option<Resume>) -> Delivery {
        let body = lock(&self.core).current_body.clone();
        match body {
            Some(body) => body.push(data, resume),
            None => Delivery::Accepted,
        }
    }

    fn on_request_end(&self) {
        let body = lock(&self.core).current_body.take();
        if let Some(body) = body {
            body.finish();
        }
    }
}

impl ConnectionHandler for HttpSession {
    fn on_data(&self, _connection: &Connection, data: Bytes, resume: Resume) -> Delivery {
        let (result, mut events) = {
            let mut core = lock(&self.core);
            // a request arriving after shutdown could never be answered
            if core.ended || (core.closing && core.parser.is_idle()) {
                core.parser.stop();
            }
            let result = core.parser.execute(&data);
            (result, core.parser.take_events())
        };

        let delivery = events.commit(self, &resume);
        match result {
            Ok(()) => delivery,
            Err(e) => {
                self.reject_request(e);
                Delivery::Accepted
            }
        }
    }

    fn on_end(&self, _connection: &Connection) {
        trace!(connection = %self.connection.id(), "peer closed its side");
        let (result, mut events) = {
            let mut core = lock(&self.core);
            core.peer_closed = true;
            let result = core.parser.finish();
            (result, core.parser.take_events())
        };

        let _ignored = events.commit(self, &Resume::noop());
        match result {
            Ok(()) => self.pump(),
            Err(e) => self.reject_request(e),
        }
    }

    fn on_error(&self, _connection: &Connection, error: NetError) {
        warn!(connection = %self.connection.id(), cause = %error, "connection error");
        self.report(error.into());
    }

    fn on_closed(&self, _connection: &Connection) {
        let (slots, body, stalled, complete) = {
            let mut core = lock(&self.core);
            if core.closed {
                return;
            }
            core.closed = true;
            let complete = !mem::replace(&mut core.notified, true);
            let slots = core.responses.drain().collect::<Vec<_>>();
            (slots, core.current_body.take(), mem::take(&mut core.stalled), complete)
        };

        for slot in slots {
            release(slot, "connection closed");
        }
        if let Some(body) = body {
            body.fail("connection closed".into());
        }
        drop(stalled);

        debug!(connection = %self.connection.id(), "connection closed");
        if complete {
            self.shared.observer.on_completed(self.connection.id());
        }
        self.shared.unregister(self.connection.id());
        self.connection.dispose();
    }
}

/// Feeds one response body producer into its slot.
struct SlotConsumer {
    session: Weak<HttpSession>,
    id: u64,
}

impl DataConsumer for SlotConsumer {
    fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> Delivery {
        match self.session.upgrade() {
            Some(session) => session.on_body_data(self.id, data, resume),
            None => Delivery::Accepted,
        }
    }

    fn on_error(&mut self, error: BoxError) {
        if let Some(session) = self.session.upgrade() {
            session.abort_transaction(self.id, HttpError::body(error));
        }
    }

    fn on_end(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.on_producer_end(self.id);
        }
    }
}
