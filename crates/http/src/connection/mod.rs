//! HTTP connection handling.
//!
//! Each accepted socket gets one session that implements
//! [`strand_net::ConnectionHandler`]. The session runs two pipelines:
//!
//! - the transaction pipeline: read data goes through the wire parser, and
//!   every committed request head opens a transaction that is handed to the
//!   [`RequestHandler`](crate::handler::RequestHandler) together with its
//!   [`RequestBody`](crate::body::RequestBody) and a [`ResponseSink`]
//! - the response pipeline: responses are written strictly in request order,
//!   their body producers one at a time, pausing whenever the socket pushes
//!   back
//!
//! The keep-alive decision of every transaction is honoured: after the last
//! response that does not keep the connection alive, the write side is ended.

mod message_writer;
mod response_queue;
mod response_sink;
mod session;

pub use response_sink::ResponseSink;
pub(crate) use session::HttpSession;
pub(crate) use response_queue::HeadDefaults;
