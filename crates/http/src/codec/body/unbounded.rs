//! Bodies delimited by the connection closing.
//!
//! An HTTP/1.0 request that carries a body but no framing header is read until
//! the peer half-closes; a response without a length to an HTTP/1.0 client is
//! written the same way. Neither side ever sees an in-band end marker.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{ParseError, PayloadItem, SendError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnboundedDecoder;

impl Decoder for UnboundedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(PayloadItem::Chunk(src.split().freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Ok(Some(PayloadItem::Eof)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnboundedEncoder {
    eof: bool,
}

impl UnboundedEncoder {
    pub fn is_finish(&self) -> bool {
        self.eof
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for UnboundedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut bytes) => {
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
            }
            PayloadItem::Eof => self.eof = true,
        }
        Ok(())
    }
}
