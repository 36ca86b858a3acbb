//! Adapter between the request decoder and the transaction pipeline.
//!
//! Decoding a chunk of socket data yields any number of wire events at once:
//! the end of one request, several pipelined requests, the first bytes of a
//! body. [`WireParser::execute`] collects them into a [`ParserEventQueue`]
//! instead of dispatching them, and [`ParserEventQueue::commit`] replays the
//! batch into a [`TransactionDelegate`].
//!
//! # Commit rule
//!
//! Every event in a batch is already resident in memory. A body chunk that is
//! followed by further events in the same batch is therefore delivered without
//! a [`Resume`] handle and can not be deferred. Only a body chunk that is the
//! very last event of the batch receives the read continuation, and only its
//! [`Delivery`] is reported back to the connection.

use std::collections::VecDeque;
use std::mem;

use bytes::{Bytes, BytesMut};
use strand_net::{Delivery, Resume};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::RequestDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead};

/// One decoded occurrence on the wire.
#[derive(Debug)]
pub enum ParserEvent {
    /// A request head; `keep_alive` already accounts for the body framing.
    HeadersParsed { head: RequestHead, keep_alive: bool },
    BodyChunk(Bytes),
    /// The current request is complete; no event of it follows.
    RequestEnded,
}

/// Receives committed wire events, in order.
pub trait TransactionDelegate {
    fn on_request(&self, head: RequestHead, keep_alive: bool);

    /// A body chunk of the current request.
    ///
    /// `resume` is `None` when the chunk can not be deferred; the returned
    /// delivery is then ignored.
    fn on_request_data(&self, data: Bytes, resume: Option<Resume>) -> Delivery;

    fn on_request_end(&self);
}

/// An ordered batch of wire events awaiting commit.
#[derive(Debug, Default)]
pub struct ParserEventQueue {
    events: VecDeque<ParserEvent>,
}

impl ParserEventQueue {
    pub fn push(&mut self, event: ParserEvent) {
        self.events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drains the batch into `delegate`.
    ///
    /// Returns the delivery of the final event if it is a body chunk, which is
    /// the only event handed `resume`; otherwise [`Delivery::Accepted`].
    pub fn commit<D>(&mut self, delegate: &D, resume: &Resume) -> Delivery
    where
        D: TransactionDelegate + ?Sized,
    {
        let mut delivery = Delivery::Accepted;
        while let Some(event) = self.events.pop_front() {
            let last = self.events.is_empty();
            match event {
                ParserEvent::HeadersParsed { head, keep_alive } => delegate.on_request(head, keep_alive),
                ParserEvent::BodyChunk(data) if last => {
                    delivery = delegate.on_request_data(data, Some(resume.clone()));
                }
                ParserEvent::BodyChunk(data) => {
                    let _ignored = delegate.on_request_data(data, None);
                }
                ParserEvent::RequestEnded => delegate.on_request_end(),
            }
        }
        delivery
    }
}

/// Incremental request parser producing [`ParserEvent`]s.
#[derive(Debug, Default)]
pub struct WireParser {
    decoder: RequestDecoder,
    buffer: BytesMut,
    events: ParserEventQueue,
    keep_alive: bool,
    /// Set once a request that does not keep the connection alive ended, or
    /// after a parse error; later input is discarded.
    stopped: bool,
}

impl WireParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `data` and queues the resulting events.
    ///
    /// On error the events decoded before the malformed input stay queued and
    /// the parser discards everything it is fed afterwards.
    pub fn execute(&mut self, data: &[u8]) -> Result<(), ParseError> {
        if self.stopped {
            trace!(size = data.len(), "discarding input after last request");
            return Ok(());
        }
        self.buffer.extend_from_slice(data);

        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(message)) => self.queue(message),
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
            if self.stopped {
                return Ok(());
            }
        }
    }

    /// Signals that the peer will send nothing more.
    ///
    /// Ends a body delimited by the connection closing; a request cut short
    /// is [`ParseError::PrematureEnd`].
    pub fn finish(&mut self) -> Result<(), ParseError> {
        if self.stopped {
            return Ok(());
        }

        loop {
            match self.decoder.decode_eof(&mut self.buffer) {
                Ok(Some(message)) => self.queue(message),
                Ok(None) => break,
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
            if self.stopped {
                break;
            }
        }
        self.stop();
        Ok(())
    }

    /// Takes the queued events, leaving the parser's queue empty.
    pub fn take_events(&mut self) -> ParserEventQueue {
        mem::take(&mut self.events)
    }

    /// Whether the parser is between requests with nothing buffered.
    pub fn is_idle(&self) -> bool {
        !self.decoder.in_body() && self.buffer.iter().all(|b| matches!(b, b'\r' | b'\n'))
    }

    fn queue(&mut self, message: Message<(RequestHead, PayloadSize)>) {
        match message {
            Message::Header((head, payload_size)) => {
                self.keep_alive = head.should_keep_alive() && !payload_size.is_unbounded();
                trace!(method = %head.method(), uri = %head.uri(), keep_alive = self.keep_alive, "request head");
                self.events.push(ParserEvent::HeadersParsed { head, keep_alive: self.keep_alive });
            }
            Message::Payload(PayloadItem::Chunk(data)) => {
                if !data.is_empty() {
                    self.events.push(ParserEvent::BodyChunk(data));
                }
            }
            Message::Payload(PayloadItem::Eof) => {
                self.events.push(ParserEvent::RequestEnded);
                if !self.keep_alive {
                    self.stop();
                }
            }
        }
    }

    /// Stops decoding; whatever is buffered or fed afterwards is discarded.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Eq)]
    enum Seen {
        Request { path: String, keep_alive: bool },
        Data { data: String, deferrable: bool },
        End,
    }

    /// Records every call and defers every deferrable chunk.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Seen>>,
        held: Mutex<Vec<Resume>>,
    }

    impl TransactionDelegate for Recorder {
        fn on_request(&self, head: RequestHead, keep_alive: bool) {
            self.seen.lock().unwrap().push(Seen::Request { path: head.uri().path().to_string(), keep_alive });
        }

        fn on_request_data(&self, data: Bytes, resume: Option<Resume>) -> Delivery {
            let deferrable = resume.is_some();
            self.seen
                .lock()
                .unwrap()
                .push(Seen::Data { data: String::from_utf8_lossy(&data).into_owned(), deferrable });
            match resume {
                Some(resume) => {
                    self.held.lock().unwrap().push(resume);
                    Delivery::Deferred
                }
                None => Delivery::Accepted,
            }
        }

        fn on_request_end(&self) {
            self.seen.lock().unwrap().push(Seen::End);
        }
    }

    fn run(input: &[u8]) -> (Vec<Seen>, Delivery) {
        let mut parser = WireParser::new();
        parser.execute(input).unwrap();
        let recorder = Recorder::default();
        let delivery = parser.take_events().commit(&recorder, &Resume::noop());
        (recorder.seen.into_inner().unwrap(), delivery)
    }

    #[test]
    fn http10_get_without_body() {
        let (seen, delivery) = run(b"GET / HTTP/1.0\r\n\r\n");

        assert_eq!(seen, vec![Seen::Request { path: "/".into(), keep_alive: false }, Seen::End]);
        assert_eq!(delivery, Delivery::Accepted);
    }

    #[test]
    fn chunked_post() {
        let (seen, _) = run(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nfoo\r\n0\r\n\r\n");

        assert_eq!(
            seen,
            vec![
                Seen::Request { path: "/x".into(), keep_alive: true },
                Seen::Data { data: "foo".into(), deferrable: false },
                Seen::End,
            ]
        );
    }

    #[test]
    fn buffered_chunk_can_not_defer() {
        let input = b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n";
        let (seen, delivery) = run(input);

        assert_eq!(
            seen,
            vec![
                Seen::Request { path: "/a".into(), keep_alive: true },
                Seen::Data { data: "abc".into(), deferrable: false },
                Seen::End,
                Seen::Request { path: "/b".into(), keep_alive: true },
                Seen::End,
            ]
        );
        assert_eq!(delivery, Delivery::Accepted);
    }

    #[test]
    fn trailing_chunk_receives_the_continuation() {
        let (seen, delivery) = run(b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");

        assert_eq!(seen.last(), Some(&Seen::Data { data: "abc".into(), deferrable: true }));
        assert_eq!(delivery, Delivery::Deferred);
    }

    #[test]
    fn events_before_an_error_are_kept() {
        let mut parser = WireParser::new();
        let result = parser.execute(b"GET /ok HTTP/1.1\r\n\r\nBROKEN LINE WITH TOO MANY TOKENS\r\n\r\n");

        assert!(matches!(result, Err(ParseError::InvalidRequestLine { .. })));
        assert_eq!(parser.take_events().len(), 2);
        parser.execute(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(parser.take_events().is_empty());
    }

    #[test]
    fn input_after_a_closing_request_is_discarded() {
        let (seen, _) = run(b"GET /a HTTP/1.1\r\nConnection: close\r\n\r\nGET /b HTTP/1.1\r\n\r\n");

        assert_eq!(seen, vec![Seen::Request { path: "/a".into(), keep_alive: false }, Seen::End]);
    }

    #[test]
    fn finish_ends_http10_body() {
        let mut parser = WireParser::new();
        parser.execute(b"POST /up HTTP/1.0\r\n\r\npart").unwrap();
        parser.finish().unwrap();

        let recorder = Recorder::default();
        let _ = parser.take_events().commit(&recorder, &Resume::noop());
        let seen = recorder.seen.into_inner().unwrap();
        assert_eq!(
            seen,
            vec![
                Seen::Request { path: "/up".into(), keep_alive: false },
                Seen::Data { data: "part".into(), deferrable: false },
                Seen::End,
            ]
        );
    }

    #[test]
    fn finish_mid_request_is_premature() {
        let mut parser = WireParser::new();
        parser.execute(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab").unwrap();
        assert!(matches!(parser.finish(), Err(ParseError::PrematureEnd)));
        parser.finish().unwrap();
    }

    #[test]
    fn idle_between_requests() {
        let mut parser = WireParser::new();
        assert!(parser.is_idle());

        parser.execute(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nab").unwrap();
        assert!(!parser.is_idle());

        parser.execute(b"cd\r\n").unwrap();
        let _ = parser.take_events();
        assert!(parser.is_idle());

        parser.execute(b"GET /next HT").unwrap();
        assert!(!parser.is_idle());
    }

    #[test]
    fn stopped_parser_ignores_later_requests() {
        let mut parser = WireParser::new();
        parser.execute(b"GET /a HTTP/1.1\r\n\r\nGET /b").unwrap();
        parser.stop();
        parser.execute(b" HTTP/1.1\r\n\r\nGET /c HTTP/1.1\r\n\r\n").unwrap();
        parser.finish().unwrap();

        let recorder = Recorder::default();
        let _ = parser.take_events().commit(&recorder, &Resume::noop());
        let seen = recorder.seen.into_inner().unwrap();
        assert_eq!(seen, vec![Seen::Request { path: "/a".into(), keep_alive: true }, Seen::End]);
    }
}
