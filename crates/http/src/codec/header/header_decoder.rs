//! Request head decoder.
//!
//! Turns the bytes of a request line plus header block into a [`RequestHead`]
//! and the [`PayloadSize`] that frames the body following it.
//!
//! A request line with three tokens (`METHOD SP URI SP VERSION`) is parsed by
//! `httparse`. A two-token line (`METHOD SP URI`) is accepted as a version-less
//! request; its header block, if any, is parsed with `httparse::parse_headers`.
//! Any other token count is rejected.
//!
//! Header names and values are sliced out of the frozen head buffer rather than
//! copied: the parser records the byte range of every field first, then the
//! buffer is split off and shared between all values.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header block size: 8 KiB

use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, Request, Uri, Version};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead};

/// Maximum number of headers allowed in a request
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the request line plus header block
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decoder for request heads implementing the [`Decoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderDecoder;

/// A head parsed in place, before the buffer is split.
struct ParsedHead {
    method: Method,
    uri: Uri,
    version: Version,
    header_count: usize,
    header_index: [HeaderIndex; MAX_HEADER_NUM],
    head_len: usize,
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHead, PayloadSize);
    type Error = ParseError;

    /// Returns `Ok(None)` until a complete head is buffered.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if:
    /// - the request line does not have two or three tokens
    /// - the number of headers exceeds 64
    /// - the head exceeds 8 KiB, complete or not
    /// - the version is neither HTTP/1.0 nor HTTP/1.1
    /// - the body framing headers are contradictory or malformed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // blank lines ahead of a request line are ignored
        let blank = src.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
        src.advance(blank);

        let Some(parsed) = parse_head(src)? else {
            ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
            return Ok(None);
        };

        trace!(head_size = parsed.head_len, headers = parsed.header_count, "parsed request head");
        ensure!(parsed.head_len <= MAX_HEADER_BYTES, ParseError::too_large_header(parsed.head_len, MAX_HEADER_BYTES));

        let mut request = Request::new(());
        *request.method_mut() = parsed.method;
        *request.uri_mut() = parsed.uri;
        *request.version_mut() = parsed.version;

        let header_bytes = src.split_to(parsed.head_len).freeze();
        let headers = request.headers_mut();
        headers.reserve(parsed.header_count);
        for index in &parsed.header_index[..parsed.header_count] {
            let name =
                HeaderName::from_bytes(&header_bytes[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_maybe_shared(header_bytes.slice(index.value.0..index.value.1))
                .map_err(ParseError::invalid_header)?;
            headers.append(name, value);
        }

        let head = RequestHead::from(request);
        let payload_size = parse_payload(&head)?;
        Ok(Some((head, payload_size)))
    }
}

/// Parses the head at the start of `src` without consuming it.
///
/// Returns `Ok(None)` while the head is incomplete.
fn parse_head(src: &[u8]) -> Result<Option<ParsedHead>, ParseError> {
    let Some(line_end) = src.iter().position(|b| *b == b'\n') else {
        return Ok(None);
    };
    let line = src[..line_end].strip_suffix(b"\r").unwrap_or(&src[..line_end]);
    let tokens: Vec<&[u8]> = line.split(|b| *b == b' ').filter(|token| !token.is_empty()).collect();

    match tokens.as_slice() {
        [_, _, _] => parse_full(src),
        [method, uri] => parse_versionless(src, method, uri, line_end + 1),
        _ => Err(ParseError::invalid_request_line(String::from_utf8_lossy(line))),
    }
}

fn parse_full(src: &[u8]) -> Result<Option<ParsedHead>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(src).map_err(map_httparse_error)? {
        Status::Complete(head_len) => head_len,
        Status::Partial => return Ok(None),
    };

    let version = match req.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        // HTTP/2 and HTTP/3 are not spoken over this transport
        other => return Err(ParseError::InvalidVersion(other)),
    };
    let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes())
        .map_err(|_invalid| ParseError::InvalidMethod)?;
    let uri = Uri::try_from(req.path.ok_or(ParseError::InvalidUri)?).map_err(|_invalid| ParseError::InvalidUri)?;

    let mut header_index = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];
    HeaderIndex::record(src, req.headers, &mut header_index);

    Ok(Some(ParsedHead { method, uri, version, header_count: req.headers.len(), header_index, head_len }))
}

fn parse_versionless(src: &[u8], method: &[u8], uri: &[u8], line_len: usize) -> Result<Option<ParsedHead>, ParseError> {
    let method = Method::from_bytes(method).map_err(|_invalid| ParseError::InvalidMethod)?;
    let uri = Uri::try_from(uri).map_err(|_invalid| ParseError::InvalidUri)?;

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
    let status = httparse::parse_headers(&src[line_len..], &mut headers).map_err(map_httparse_error)?;
    let (block_len, parsed) = match status {
        Status::Complete(complete) => complete,
        Status::Partial => return Ok(None),
    };

    let mut header_index = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];
    HeaderIndex::record(src, parsed, &mut header_index);

    Ok(Some(ParsedHead {
        method,
        uri,
        version: Version::HTTP_09,
        header_count: parsed.len(),
        header_index,
        head_len: line_len + block_len,
    }))
}

fn map_httparse_error(e: httparse::Error) -> ParseError {
    match e {
        httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        httparse::Error::Version => ParseError::InvalidVersion(None),
        e => ParseError::invalid_header(e),
    }
}

/// Byte ranges of a header's name and value within the head buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

impl HeaderIndex {
    /// Records where each parsed header lives inside `bytes`.
    ///
    /// `headers` must borrow from `bytes`.
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, index) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            index.name = (name_start, name_start + header.name.len());
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            index.value = (value_start, value_start + header.value.len());
        }
    }
}

/// Works out how the body after `head` is framed.
///
/// refer: <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>
fn parse_payload(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    let te_header = head.headers().get(TRANSFER_ENCODING);
    let cl_header = head.headers().get(CONTENT_LENGTH);

    match (te_header, cl_header) {
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer-encoding and content-length both present in headers"))
        }

        (Some(te_value), None) => {
            if is_chunked(te_value) {
                Ok(PayloadSize::Chunked)
            } else {
                Err(ParseError::invalid_body("transfer-encoding without chunked as the final encoding"))
            }
        }

        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(ParseError::invalid_content_length)?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|e| ParseError::invalid_content_length(format!("value {cl_str} is not u64: {e}")))?;

            Ok(if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) })
        }

        (None, None) if head.version() == Version::HTTP_10 && head.need_body() => Ok(PayloadSize::Unbounded),
        (None, None) => Ok(PayloadSize::Empty),
    }
}

/// Whether `chunked` is the final transfer coding.
fn is_chunked(value: &HeaderValue) -> bool {
    value
        .as_bytes()
        .rsplit(|b| *b == b',')
        .next()
        .is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
