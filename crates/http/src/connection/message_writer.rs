use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::ResponseEncoder;
use crate::protocol::{Message, PayloadSize, ResponseHead, SendError};

const INIT_BUFFER_SIZE: usize = 4 * 1024;

/// Encodes one response into a staging buffer that the session hands to the
/// connection in pieces.
#[derive(Debug)]
pub(crate) struct MessageWriter {
    buffer: BytesMut,
    encoder: ResponseEncoder,
}

impl MessageWriter {
    pub(crate) fn new(encoder: ResponseEncoder) -> Self {
        Self { buffer: BytesMut::with_capacity(INIT_BUFFER_SIZE), encoder }
    }

    #[inline]
    pub(crate) fn write<D>(&mut self, item: Message<(ResponseHead, PayloadSize), D>) -> Result<(), SendError>
    where
        D: Buf,
    {
        self.encoder.encode(item, &mut self.buffer)
    }

    /// Takes everything encoded since the last call.
    #[inline]
    pub(crate) fn take(&mut self) -> Bytes {
        self.buffer.split().freeze()
    }

    pub(crate) fn is_finish(&self) -> bool {
        self.encoder.is_finish()
    }
}
