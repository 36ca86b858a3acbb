use bytes::{Buf, Bytes};

/// What the codecs exchange: a head, then the items of its payload.
///
/// Requests decode to `Message<(RequestHead, PayloadSize)>`; responses encode
/// from `Message<(ResponseHead, PayloadSize)>`. The [`PayloadSize`] travelling
/// with the head decides how the items that follow are framed.
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

/// A piece of body data, or the end of the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    pub fn into_bytes(self) -> Option<D> {
        match self {
            Self::Chunk(data) => Some(data),
            Self::Eof => None,
        }
    }
}

/// Body framing on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length: n`
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// No body.
    Empty,
    /// Delimited by the connection closing; rules out keep-alive.
    Unbounded,
}

impl PayloadSize {
    pub fn is_unbounded(self) -> bool {
        self == Self::Unbounded
    }
}
