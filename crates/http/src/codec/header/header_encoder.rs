//! Response head encoder.
//!
//! Serializes the status line and header block of a response. The framing
//! headers (`Content-Length`, `Transfer-Encoding`) are rewritten to match the
//! [`PayloadSize`] actually used, `Connection` is set from the keep-alive
//! decision, and `Server` and `Date` are injected when the handler did not set
//! them.

use std::io::Write;

use bytes::{BufMut, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, DATE, SERVER, TRANSFER_ENCODING};
use http::{HeaderValue, StatusCode, Version};
use tokio_util::codec::Encoder;

use crate::codec::FastWrite;
use crate::protocol::{PayloadSize, ResponseHead, SendError};

/// Initial buffer size reserved for a response head
const INIT_HEADER_SIZE: usize = 4 * 1024;

const CHUNKED: HeaderValue = HeaderValue::from_static("chunked");
const CLOSE: HeaderValue = HeaderValue::from_static("close");
const KEEP_ALIVE: HeaderValue = HeaderValue::from_static("keep-alive");
const ZERO: HeaderValue = HeaderValue::from_static("0");

/// Encoder for response heads, configured per transaction.
#[derive(Debug, Clone)]
pub struct HeaderEncoder {
    version: Version,
    keep_alive: bool,
    server: Option<HeaderValue>,
    date: Option<HeaderValue>,
}

impl HeaderEncoder {
    /// `version` is the request's version; the status line answers in kind.
    pub fn new(version: Version, keep_alive: bool) -> Self {
        Self { version, keep_alive, server: None, date: None }
    }

    #[must_use]
    pub fn server(mut self, server: HeaderValue) -> Self {
        self.server = Some(server);
        self
    }

    #[must_use]
    pub fn date(mut self, date: HeaderValue) -> Self {
        self.date = Some(date);
        self
    }
}

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;
        let status = head.status();
        let headers = head.headers_mut();

        dst.reserve(INIT_HEADER_SIZE);
        let version = if self.version == Version::HTTP_11 { "HTTP/1.1" } else { "HTTP/1.0" };
        write!(FastWrite(dst), "{version} {} {}\r\n", status.as_str(), status.canonical_reason().unwrap_or(""))?;

        let mut keep_alive = self.keep_alive;
        match payload_size {
            PayloadSize::Length(n) => {
                headers.remove(TRANSFER_ENCODING);
                headers.insert(CONTENT_LENGTH, n.into());
            }
            PayloadSize::Chunked => {
                headers.remove(CONTENT_LENGTH);
                headers.insert(TRANSFER_ENCODING, CHUNKED);
            }
            PayloadSize::Empty => {
                headers.remove(TRANSFER_ENCODING);
                // a HEAD response keeps the length the handler announced
                if !headers.contains_key(CONTENT_LENGTH) && !omits_length(status) {
                    headers.insert(CONTENT_LENGTH, ZERO);
                }
            }
            PayloadSize::Unbounded => {
                headers.remove(TRANSFER_ENCODING);
                headers.remove(CONTENT_LENGTH);
                keep_alive = false;
            }
        }

        if !keep_alive {
            headers.insert(CONNECTION, CLOSE);
        } else if self.version != Version::HTTP_11 {
            headers.insert(CONNECTION, KEEP_ALIVE);
        }

        if let Some(server) = self.server.take() {
            headers.entry(SERVER).or_insert(server);
        }
        if let Some(date) = self.date.take() {
            headers.entry(DATE).or_insert(date);
        }

        for (name, value) in headers.iter() {
            dst.put_slice(name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

fn omits_length(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}
