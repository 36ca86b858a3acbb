//! Decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! See [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//! Chunk extensions and trailer fields are consumed and discarded.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

/// Upper bound for a chunk-size line including extensions.
const MAX_SIZE_LINE: usize = 4 * 1024;

/// Upper bound for one trailer line.
const MAX_TRAILER_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting `<hex-size>[;ext]\r\n`
    SizeLine,
    /// Inside chunk data with this many bytes still to come
    Data(u64),
    /// Expecting the CRLF that closes chunk data
    DataEnd,
    /// After the last chunk, reading trailer lines until an empty one
    Trailer,
    Done,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::SizeLine }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Done => return Ok(Some(PayloadItem::Eof)),

                State::SizeLine => {
                    let Some(line) = take_line(src, MAX_SIZE_LINE, "chunk size line")? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    trace!(size, "chunk header");
                    self.state = if size == 0 { State::Trailer } else { State::Data(size) };
                }

                State::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = usize::try_from(remaining).map_or(src.len(), |remaining| remaining.min(src.len()));
                    let bytes = src.split_to(take).freeze();
                    let left = remaining - bytes.len() as u64;
                    self.state = if left == 0 { State::DataEnd } else { State::Data(left) };
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                State::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(ParseError::invalid_body("missing CRLF after chunk data"));
                    }
                    src.advance(2);
                    self.state = State::SizeLine;
                }

                State::Trailer => {
                    let Some(line) = take_line(src, MAX_TRAILER_LINE, "chunked trailer")? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        trace!("finished reading chunked data");
                        self.state = State::Done;
                    }
                }
            }
        }
    }
}

/// Splits one CRLF-terminated line off `src`, without the terminator.
fn take_line(src: &mut BytesMut, limit: usize, what: &str) -> Result<Option<BytesMut>, ParseError> {
    let Some(lf) = src.iter().position(|b| *b == b'\n') else {
        if src.len() > limit {
            return Err(ParseError::invalid_body(format!("{what} too long")));
        }
        return Ok(None);
    };
    if lf == 0 || src[lf - 1] != b'\r' {
        return Err(ParseError::invalid_body(format!("{what} not terminated by CRLF")));
    }
    let mut line = src.split_to(lf + 1);
    line.truncate(lf - 1);
    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size_part = match line.iter().position(|b| *b == b';') {
        Some(ext) => &line[..ext],
        None => line,
    };
    let digits = size_part.trim_ascii();
    if digits.is_empty() {
        return Err(ParseError::invalid_body("empty chunk size"));
    }

    digits.iter().try_fold(0_u64, |size, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_body("invalid chunk size digit")),
        };
        size.checked_mul(16)
            .and_then(|size| size.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("chunk size overflow"))
    })
}
