//! Per-transaction response state, queued in request order.
//!
//! Only the slot at the front of the [`ResponseQueue`] may write to the
//! connection. A slot renders its head lazily: right before its first body
//! byte, or when it finishes without a body. Until then the head can still be
//! replaced, which is how an aborted transaction turns into a `500`.

use std::collections::VecDeque;
use std::fmt;

use bytes::Bytes;
use http::header::CONTENT_LENGTH;
use http::{HeaderValue, Method, StatusCode, Version};
use strand_net::{DataProducer, Subscription};
use tracing::warn;

use crate::body::BodyChannel;
use crate::codec::{HeaderEncoder, ResponseEncoder};
use crate::connection::message_writer::MessageWriter;
use crate::protocol::{
    Message, PayloadItem, PayloadSize, RequestHead, ResponseHead, SendError, has_connection_token, status_head,
};

/// Headers every response carries unless the handler set them.
#[derive(Debug, Clone)]
pub(crate) struct HeadDefaults {
    pub(crate) server: HeaderValue,
    pub(crate) date: Option<HeaderValue>,
}

/// What the front slot needs next.
pub(crate) enum SlotAction {
    /// Write the interim `100 Continue` block.
    Continue,
    /// Connect this producer; its output belongs to the slot.
    Connect(Box<dyn DataProducer>),
    /// Every producer is done and the response was ended.
    Finish,
    /// Waiting on the handler or on a connected producer.
    Wait,
}

pub(crate) struct ResponseSlot {
    id: u64,
    version: Version,
    keep_alive: bool,
    head_only: bool,
    continue_pending: bool,
    head: Option<ResponseHead>,
    writer: Option<MessageWriter>,
    producers: VecDeque<Box<dyn DataProducer>>,
    active: bool,
    subscription: Option<Subscription>,
    end_requested: bool,
    aborted: bool,
    request_body: Option<BodyChannel>,
}

impl ResponseSlot {
    pub(crate) fn new(id: u64, request: &RequestHead, keep_alive: bool, request_body: BodyChannel) -> Self {
        Self {
            id,
            version: request.version(),
            keep_alive,
            head_only: *request.method() == Method::HEAD,
            continue_pending: false,
            head: None,
            writer: None,
            producers: VecDeque::new(),
            active: false,
            subscription: None,
            end_requested: false,
            aborted: false,
            request_body: Some(request_body),
        }
    }

    /// A complete bodyless response that closes the connection, used when no
    /// request could be parsed.
    pub(crate) fn error(id: u64, status: StatusCode) -> Self {
        Self {
            id,
            version: Version::HTTP_11,
            keep_alive: false,
            head_only: false,
            continue_pending: false,
            head: Some(status_head(status)),
            writer: None,
            producers: VecDeque::new(),
            active: false,
            subscription: None,
            end_requested: true,
            aborted: false,
            request_body: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_rendered(&self) -> bool {
        self.writer.is_some()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) fn request_continue(&mut self) {
        if !self.is_rendered() && !self.aborted {
            self.continue_pending = true;
        }
    }

    pub(crate) fn set_head(&mut self, head: ResponseHead) {
        if !self.aborted && !self.is_rendered() {
            self.head = Some(head);
        }
    }

    /// Queues a body producer. Returns it back when the slot no longer takes
    /// output.
    pub(crate) fn push_producer(&mut self, producer: Box<dyn DataProducer>) -> Option<Box<dyn DataProducer>> {
        if self.aborted || self.end_requested {
            return Some(producer);
        }
        self.producers.push_back(producer);
        None
    }

    pub(crate) fn request_end(&mut self) {
        self.end_requested = true;
    }

    /// The producer connected last has ended.
    pub(crate) fn producer_ended(&mut self) {
        self.active = false;
        self.subscription = None;
    }

    /// Keeps the subscription of the active producer. Returns it back when
    /// the producer already finished or the slot was aborted meanwhile.
    pub(crate) fn attach_subscription(&mut self, subscription: Subscription) -> Option<Subscription> {
        if self.active && !self.aborted {
            self.subscription = Some(subscription);
            None
        } else {
            Some(subscription)
        }
    }

    pub(crate) fn next_action(&mut self) -> SlotAction {
        if self.continue_pending {
            self.continue_pending = false;
            return SlotAction::Continue;
        }
        if self.active {
            return SlotAction::Wait;
        }
        if let Some(producer) = self.producers.pop_front() {
            self.active = true;
            return SlotAction::Connect(producer);
        }
        if self.end_requested { SlotAction::Finish } else { SlotAction::Wait }
    }

    /// Encodes one body chunk, preceded by the head if this is the first.
    pub(crate) fn encode_data(&mut self, data: Bytes, defaults: &HeadDefaults) -> Result<Bytes, SendError> {
        let head_only = self.head_only;
        let writer = self.render(defaults)?;
        if !head_only {
            writer.write(Message::Payload(PayloadItem::Chunk(data)))?;
        }
        Ok(writer.take())
    }

    /// Encodes whatever completes the response: the head if it was not
    /// written yet, then the body terminator.
    ///
    /// An aborted slot whose head is already out gets no terminator, so the
    /// peer sees a truncated body rather than a complete one. A head that
    /// announces a length but never got a body becomes a `500`. Whatever was
    /// encoded is returned even when the response turned out malformed.
    pub(crate) fn finish(&mut self, defaults: &HeadDefaults) -> (Bytes, Option<SendError>) {
        let mut error = self.missing_body().map(|length| {
            warn!(transaction = self.id, length, "response ended without its announced body");
            self.head = Some(status_head(StatusCode::INTERNAL_SERVER_ERROR));
            self.keep_alive = false;
            SendError::invalid_body(format!("no body for a content-length of {length}"))
        });

        let truncated = self.aborted && self.is_rendered();
        let head_only = self.head_only;
        let writer = match self.render(defaults) {
            Ok(writer) => writer,
            Err(e) => return (Bytes::new(), Some(e)),
        };
        if !truncated
            && !head_only
            && !writer.is_finish()
            && let Err(e) = writer.write(Message::<_, Bytes>::Payload(PayloadItem::Eof))
        {
            error = Some(e);
        }
        (writer.take(), error)
    }

    /// The announced length of an unrendered head whose body never came.
    fn missing_body(&self) -> Option<u64> {
        if self.is_rendered() || self.head_only {
            return None;
        }
        let head = self.head.as_ref()?;
        match self.framing(head) {
            PayloadSize::Length(length) => Some(length),
            _ => None,
        }
    }

    /// Gives up on the response.
    ///
    /// If the head was not rendered yet it becomes `status`, otherwise the body
    /// is cut short. Either way the connection closes after this slot. Returns
    /// the subscription of a producer that is still connected.
    pub(crate) fn abort(&mut self, status: StatusCode) -> Option<Subscription> {
        self.aborted = true;
        self.keep_alive = false;
        self.continue_pending = false;
        self.producers.clear();
        self.active = false;
        self.end_requested = true;
        if !self.is_rendered() {
            self.head = Some(status_head(status));
            self.head_only = false;
        }
        self.subscription.take()
    }

    /// Detaches the request body channel, leaving the slot without one.
    pub(crate) fn take_request_body(&mut self) -> Option<BodyChannel> {
        self.request_body.take()
    }

    /// Releases whatever is still connected when the connection goes away.
    pub(crate) fn discard(mut self) -> (Option<Subscription>, Option<BodyChannel>) {
        self.producers.clear();
        (self.subscription.take(), self.request_body.take())
    }

    fn render(&mut self, defaults: &HeadDefaults) -> Result<&mut MessageWriter, SendError> {
        if self.writer.is_none() {
            let head = self.head.take().unwrap_or_else(|| {
                warn!(transaction = self.id, "response ended without a head");
                status_head(StatusCode::INTERNAL_SERVER_ERROR)
            });
            if has_connection_token(head.headers(), "close") {
                self.keep_alive = false;
            }
            let payload_size = self.framing(&head);
            if payload_size.is_unbounded() {
                self.keep_alive = false;
            }

            let mut encoder = HeaderEncoder::new(self.version, self.keep_alive).server(defaults.server.clone());
            if let Some(date) = &defaults.date {
                encoder = encoder.date(date.clone());
            }
            let mut writer = MessageWriter::new(ResponseEncoder::new(encoder));
            writer.write(Message::<_, Bytes>::Header((head, payload_size)))?;
            self.writer = Some(writer);
        }

        self.writer.as_mut().ok_or_else(|| SendError::invalid_body("response writer missing"))
    }

    fn framing(&self, head: &ResponseHead) -> PayloadSize {
        let status = head.status();
        let length = content_length(head);

        if self.head_only {
            return length.map_or(PayloadSize::Empty, PayloadSize::Length);
        }
        if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
            return PayloadSize::Empty;
        }

        match length {
            Some(0) => PayloadSize::Empty,
            Some(n) => PayloadSize::Length(n),
            None if self.end_requested && !self.active && self.producers.is_empty() => PayloadSize::Empty,
            None if self.version == Version::HTTP_11 => PayloadSize::Chunked,
            None => PayloadSize::Unbounded,
        }
    }
}

impl fmt::Debug for ResponseSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSlot")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .field("rendered", &self.is_rendered())
            .field("producers", &self.producers.len())
            .field("active", &self.active)
            .field("end_requested", &self.end_requested)
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

fn content_length(head: &ResponseHead) -> Option<u64> {
    head.headers().get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

/// Slots of one connection, oldest first.
#[derive(Debug, Default)]
pub(crate) struct ResponseQueue {
    slots: VecDeque<ResponseSlot>,
}

impl ResponseQueue {
    pub(crate) fn push(&mut self, slot: ResponseSlot) {
        self.slots.push_back(slot);
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut ResponseSlot> {
        self.slots.front_mut()
    }

    pub(crate) fn pop_front(&mut self) -> Option<ResponseSlot> {
        self.slots.pop_front()
    }

    pub(crate) fn find_mut(&mut self, id: u64) -> Option<&mut ResponseSlot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ResponseSlot> + '_ {
        self.slots.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BytesProducer;
    use http::Request;

    fn defaults() -> HeadDefaults {
        HeadDefaults { server: HeaderValue::from_static("strand"), date: None }
    }

    fn slot(method: Method, version: Version) -> ResponseSlot {
        let request = Request::builder().method(method).version(version).uri("/").body(()).unwrap();
        ResponseSlot::new(1, &RequestHead::from(request), true, BodyChannel::new())
    }

    fn finished(slot: &mut ResponseSlot) -> Bytes {
        let (output, error) = slot.finish(&defaults());
        assert!(error.is_none(), "unexpected error: {error:?}");
        output
    }

    fn text(bytes: &Bytes) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn bodyless_response_is_rendered_on_finish() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        slot.set_head(status_head(StatusCode::NO_CONTENT));
        slot.request_end();

        assert!(matches!(slot.next_action(), SlotAction::Finish));
        let out = text(&finished(&mut slot));
        assert!(out.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!out.contains("content-length"));
        assert!(slot.keep_alive());
    }

    #[test]
    fn http11_body_without_length_is_chunked() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        slot.set_head(status_head(StatusCode::OK));
        assert!(slot.push_producer(Box::new(BytesProducer::new("hi"))).is_none());
        slot.request_end();

        assert!(matches!(slot.next_action(), SlotAction::Connect(_)));
        let first = text(&slot.encode_data(Bytes::from_static(b"hi"), &defaults()).unwrap());
        assert!(first.contains("transfer-encoding: chunked\r\n"));
        assert!(first.ends_with("\r\n\r\n2\r\nhi\r\n"));

        slot.producer_ended();
        assert!(matches!(slot.next_action(), SlotAction::Finish));
        assert_eq!(text(&finished(&mut slot)), "0\r\n\r\n");
    }

    #[test]
    fn http10_body_without_length_closes() {
        let mut slot = slot(Method::GET, Version::HTTP_10);
        slot.set_head(status_head(StatusCode::OK));
        let _ = slot.push_producer(Box::new(BytesProducer::new("x")));
        let _ = slot.next_action();

        let out = text(&slot.encode_data(Bytes::from_static(b"x"), &defaults()).unwrap());
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nx"));
        assert!(!slot.keep_alive());
    }

    #[test]
    fn head_request_keeps_length_and_drops_body() {
        let mut slot = slot(Method::HEAD, Version::HTTP_11);
        let mut head = status_head(StatusCode::OK);
        head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        slot.set_head(head);
        let _ = slot.push_producer(Box::new(BytesProducer::new("hello")));
        let _ = slot.next_action();

        let out = text(&slot.encode_data(Bytes::from_static(b"hello"), &defaults()).unwrap());
        assert!(out.contains("content-length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));

        slot.producer_ended();
        slot.request_end();
        assert!(finished(&mut slot).is_empty());
    }

    #[test]
    fn abort_before_head_becomes_server_error() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        slot.set_head(status_head(StatusCode::OK));
        assert!(slot.abort(StatusCode::INTERNAL_SERVER_ERROR).is_none());

        assert!(matches!(slot.next_action(), SlotAction::Finish));
        let out = text(&finished(&mut slot));
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("connection: close\r\n"));
        assert!(out.contains("content-length: 0\r\n"));
    }

    #[test]
    fn abort_after_head_truncates() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        slot.set_head(status_head(StatusCode::OK));
        let _ = slot.push_producer(Box::new(BytesProducer::new("part")));
        let _ = slot.next_action();
        let _ = slot.encode_data(Bytes::from_static(b"part"), &defaults()).unwrap();

        let _ = slot.abort(StatusCode::INTERNAL_SERVER_ERROR);
        assert!(finished(&mut slot).is_empty());
        assert!(!slot.keep_alive());
    }

    #[test]
    fn announced_body_that_never_came_becomes_server_error() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        let mut head = status_head(StatusCode::OK);
        head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        slot.set_head(head);
        slot.request_end();

        let (output, error) = slot.finish(&defaults());
        let out = text(&output);
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{out}");
        assert!(out.contains("connection: close\r\n"));
        assert!(matches!(error, Some(SendError::InvalidBody { .. })));
        assert!(!slot.keep_alive());
    }

    #[test]
    fn short_body_keeps_what_was_written() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        let mut head = status_head(StatusCode::OK);
        head.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        slot.set_head(head);
        let _ = slot.push_producer(Box::new(BytesProducer::new("ab")));
        let _ = slot.next_action();
        let first = text(&slot.encode_data(Bytes::from_static(b"ab"), &defaults()).unwrap());
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(first.ends_with("\r\n\r\nab"));

        slot.producer_ended();
        slot.request_end();
        let (output, error) = slot.finish(&defaults());
        assert!(output.is_empty());
        assert!(matches!(error, Some(SendError::InvalidBody { .. })));
    }

    #[test]
    fn missing_head_becomes_server_error() {
        let mut slot = slot(Method::GET, Version::HTTP_11);
        slot.request_end();

        let out = text(&finished(&mut slot));
        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn continue_is_only_offered_before_the_head() {
        let mut slot = slot(Method::POST, Version::HTTP_11);
        slot.request_continue();
        assert!(matches!(slot.next_action(), SlotAction::Continue));
        assert!(matches!(slot.next_action(), SlotAction::Wait));
    }

    #[test]
    fn queue_finds_slots_by_id() {
        let mut queue = ResponseQueue::default();
        queue.push(ResponseSlot::error(7, StatusCode::BAD_REQUEST));
        queue.push(ResponseSlot::error(8, StatusCode::BAD_REQUEST));

        assert!(queue.find_mut(8).is_some());
        assert!(queue.find_mut(9).is_none());
        assert_eq!(queue.pop_front().map(|slot| slot.id()), Some(7));
        assert_eq!(queue.drain().count(), 1);
        assert!(queue.is_empty());
    }
}
