use std::io;

use http::StatusCode;
use strand_net::{BoxError, NetError};
use thiserror::Error;

/// The first failure of a connection, as handed to the
/// [`TransactionObserver`](crate::TransactionObserver).
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {source}")]
    Request {
        #[from]
        source: ParseError,
    },

    #[error("failed to write response: {source}")]
    Response {
        #[from]
        source: SendError,
    },

    #[error("transport failure: {source}")]
    Transport {
        #[from]
        source: NetError,
    },

    #[error("handler gave up: {reason}")]
    Handler { reason: String },

    #[error("response body source failed: {source}")]
    Body { source: BoxError },
}

impl HttpError {
    pub fn handler<S: ToString>(reason: S) -> Self {
        Self::Handler { reason: reason.to_string() }
    }

    pub fn body(source: BoxError) -> Self {
        Self::Body { source }
    }
}

/// Why a request could not be decoded.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header block of {current_size} bytes is over the {max_size} byte limit")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} headers")]
    TooManyHeaders { max_num: usize },

    #[error("bad header: {reason}")]
    InvalidHeader { reason: String },

    #[error("bad request line: {reason}")]
    InvalidRequestLine { reason: String },

    #[error("unsupported http version {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("bad method token")]
    InvalidMethod,

    #[error("bad request target")]
    InvalidUri,

    #[error("bad content-length: {reason}")]
    InvalidContentLength { reason: String },

    #[error("bad body framing: {reason}")]
    InvalidBody { reason: String },

    #[error("peer closed before the request was complete")]
    PrematureEnd,

    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_request_line<S: ToString>(reason: S) -> Self {
        Self::InvalidRequestLine { reason: reason.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    /// Status of the error response sent back for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::TooLargeHeader { .. } | Self::TooManyHeaders { .. } => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Misuse of a [`ResponseSink`](crate::ResponseSink), or a body that does not
/// fit its framing.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("100 Continue already written")]
    ContinueAlreadySent,

    #[error("response head already set")]
    HeadAlreadySent,

    #[error("no response head yet")]
    HeadNotSent,

    #[error("response already ended")]
    AlreadyEnded,

    #[error("body is longer than its content-length of {length}")]
    ContentLengthExceeded { length: u64 },

    #[error("bad body: {reason}")]
    InvalidBody { reason: String },

    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_limits_map_to_431() {
        assert_eq!(ParseError::too_many_headers(64).status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::too_large_header(9000, 8192).status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
        assert_eq!(ParseError::invalid_request_line("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::PrematureEnd.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn observer_errors_name_their_layer() {
        let error = HttpError::from(ParseError::InvalidMethod);
        assert_eq!(error.to_string(), "malformed request: bad method token");

        let error = HttpError::from(SendError::ContentLengthExceeded { length: 3 });
        assert_eq!(error.to_string(), "failed to write response: body is longer than its content-length of 3");
    }
}
