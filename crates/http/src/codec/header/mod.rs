//! Request head decoding and response head encoding.
//!
//! - [`HeaderDecoder`]: request line plus header block into a
//!   [`RequestHead`](crate::protocol::RequestHead) and the body framing
//! - [`HeaderEncoder`]: status line plus header block, with the framing,
//!   `Connection`, `Server` and `Date` headers filled in

mod header_decoder;
mod header_encoder;

pub use header_decoder::HeaderDecoder;
pub use header_encoder::HeaderEncoder;
