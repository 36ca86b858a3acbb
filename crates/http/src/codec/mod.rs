//! HTTP codec module for encoding and decoding HTTP messages
//!
//! Both directions are `tokio_util` codecs driven by hand: the wire parser
//! feeds every read into a [`RequestDecoder`], and each response owns a
//! [`ResponseEncoder`] that renders into the connection's output.
//!
//! - Request handling:
//!   - [`RequestDecoder`]: request heads followed by their body items
//!   - head parsing via the [`header`] module
//!   - body framing via the [`body`] module
//!
//! - Response handling:
//!   - [`ResponseEncoder`]: a response head followed by its body items
//!   - [`HeaderEncoder`]: per-transaction head settings

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use header::HeaderEncoder;
pub use request_decoder::RequestDecoder;
pub use response_encoder::ResponseEncoder;

use std::io;

use bytes::{BufMut, BytesMut};

/// `io::Write` over a `BytesMut`, for `write!` into an output buffer.
pub(crate) struct FastWrite<'a>(pub(crate) &'a mut BytesMut);

impl io::Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
