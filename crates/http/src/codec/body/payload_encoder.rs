use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::body::chunked_encoder::ChunkedEncoder;
use crate::codec::body::length_encoder::LengthEncoder;
use crate::codec::body::unbounded::UnboundedEncoder;
use crate::protocol::{PayloadItem, PayloadSize, SendError};

/// Writes a response body with the framing its head announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthEncoder),
    Chunked(ChunkedEncoder),
    Unbounded(UnboundedEncoder),
    /// The head said there is no body; chunks are dropped.
    NoBody { eof: bool },
}

impl PayloadEncoder {
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            Kind::Length(encoder) => encoder.is_finish(),
            Kind::Chunked(encoder) => encoder.is_finish(),
            Kind::Unbounded(encoder) => encoder.is_finish(),
            Kind::NoBody { eof } => *eof,
        }
    }
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(size: PayloadSize) -> Self {
        let kind = match size {
            PayloadSize::Length(n) => Kind::Length(LengthEncoder::new(n)),
            PayloadSize::Chunked => Kind::Chunked(ChunkedEncoder::new()),
            PayloadSize::Unbounded => Kind::Unbounded(UnboundedEncoder::default()),
            PayloadSize::Empty => Kind::NoBody { eof: false },
        };
        Self { kind }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match &mut self.kind {
            Kind::Length(encoder) => encoder.encode(item, dst),
            Kind::Chunked(encoder) => encoder.encode(item, dst),
            Kind::Unbounded(encoder) => encoder.encode(item, dst),
            Kind::NoBody { eof } => {
                *eof |= item.is_eof();
                Ok(())
            }
        }
    }
}
