//! Core HTTP protocol types.
//!
//! - [`message`]-level framing: [`Message`], [`PayloadItem`] and [`PayloadSize`]
//! - [`RequestHead`]: a parsed request line plus headers, with the keep-alive
//!   and `Expect: 100-continue` decisions derived from them
//! - [`ResponseHead`]: a response status line plus headers
//! - errors: [`HttpError`] wrapping [`ParseError`] for the request side and
//!   [`SendError`] for the response side

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHead;
pub(crate) use request::has_connection_token;

mod response;
pub use response::ResponseHead;
pub use response::status_head;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
