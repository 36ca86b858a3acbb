//! Body framing for requests and responses.
//!
//! ## Decoders
//! - [`PayloadDecoder`]: dispatches to the length, chunked or until-close
//!   decoder chosen from the request head
//!
//! ## Encoders
//! - [`PayloadEncoder`]: dispatches to the length, chunked or until-close
//!   encoder chosen from the response head

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;
mod unbounded;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
