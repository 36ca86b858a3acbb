//! An HTTP/1.0 and HTTP/1.1 server on top of the `strand-net` socket engine.
//!
//! Everything runs on one scheduler thread: connections read, parse, dispatch
//! to the handler and write without any locking across the pipeline. Request
//! bodies are pushed to the handler with backpressure, so a handler that is
//! slow to take data stops the socket from being read.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1, keep-alive and pipelining
//! - Length, chunked and until-close body framing in both directions
//! - Streaming request bodies with backpressure
//! - `Expect: 100-continue` under handler control
//! - `400`/`500` responses for malformed requests and failed handlers
//! - Graceful shutdown
//!
//! # Example
//!
//! ```no_run
//! use http::{Response, StatusCode};
//! use strand_http::body::{BytesProducer, RequestBody};
//! use strand_http::connection::ResponseSink;
//! use strand_http::protocol::RequestHead;
//! use strand_http::server::HttpServer;
//! use strand_net::Scheduler;
//!
//! fn hello(_head: RequestHead, _body: RequestBody, response: ResponseSink) {
//!     let head = Response::builder().status(StatusCode::OK).header("content-length", 6).body(()).unwrap();
//!     let _ = response.respond(head);
//!     let _ = response.write_body(BytesProducer::new("hello\n"));
//!     let _ = response.end();
//! }
//!
//! let scheduler = Scheduler::builder().build().unwrap();
//! scheduler.start().unwrap();
//!
//! let server = HttpServer::builder().address("127.0.0.1:8080").handler(hello).build(scheduler.handle()).unwrap();
//! println!("listening on {:?}", server.local_addr());
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: request decoding and response encoding
//! - [`wire`]: turns socket data into committed transaction events
//! - [`connection`]: the per-connection transaction and response pipelines
//! - [`body`]: request body channel and body producers
//! - [`handler`]: the handler trait and the async function adapter
//! - [`server`]: listeners, the observer and graceful close
//! - [`protocol`]: heads, messages and errors

pub mod body;
pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod wire;

mod date;
mod utils;
pub(crate) use utils::ensure;

pub use body::{BodyProducer, BytesProducer, IncomingBody, RequestBody, collect_body};
pub use connection::ResponseSink;
pub use handler::{HandlerFn, RequestHandler, make_handler};
pub use protocol::{HttpError, ParseError, RequestHead, ResponseHead, SendError};
pub use server::{HttpServer, ServerBuildError, ServerBuilder, TransactionObserver};
