//! Request and response bodies.
//!
//! Bodies are push streams built on [`strand_net::DataProducer`] and
//! [`strand_net::DataConsumer`]:
//!
//! - [`RequestBody`]: the producer a handler connects to in order to read the
//!   request body
//! - [`BytesProducer`] and [`BodyProducer`]: producers for response bodies, from
//!   memory or from any `http_body::Body`
//! - [`collect_body`]: buffers a whole request body
//! - [`IncomingBody`]: reads a request body as an `http_body::Body`

mod incoming;
mod producer;
mod request_body;

pub use incoming::IncomingBody;
pub use producer::{BodyProducer, BytesProducer, collect_body};
pub use request_body::RequestBody;
pub(crate) use request_body::BodyChannel;
