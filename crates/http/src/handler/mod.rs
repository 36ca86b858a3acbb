//! Request handlers.
//!
//! A [`RequestHandler`] is called on the scheduler thread once per request
//! head, with the request body as a producer and a [`ResponseSink`] for the
//! answer. It must not block: slow work goes elsewhere, and the sink can be
//! used from any thread.
//!
//! Plain closures with the same signature are handlers. [`make_handler`]
//! adapts an async function from `Request` to `Response` instead; the future
//! runs on the scheduler's I/O driver.

use std::future::Future;

use http::{Request, Response};
use http_body::Body;
use strand_net::BoxError;
use tracing::error;

use crate::body::{IncomingBody, RequestBody};
use crate::connection::ResponseSink;
use crate::protocol::RequestHead;

pub trait RequestHandler: Send + Sync {
    fn on_request(&self, head: RequestHead, body: RequestBody, response: ResponseSink);
}

impl<F> RequestHandler for F
where
    F: Fn(RequestHead, RequestBody, ResponseSink) + Send + Sync,
{
    fn on_request(&self, head: RequestHead, body: RequestBody, response: ResponseSink) {
        self(head, body, response);
    }
}

/// An async function used as a [`RequestHandler`].
#[derive(Debug)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut, RespBody, Err> RequestHandler for HandlerFn<F>
where
    F: Fn(Request<IncomingBody>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<RespBody>, Err>> + Send + 'static,
    RespBody: Body + Send + Unpin + 'static,
    RespBody::Data: Send,
    RespBody::Error: Into<BoxError> + Send,
    Err: Into<BoxError> + Send + 'static,
{
    fn on_request(&self, head: RequestHead, body: RequestBody, response: ResponseSink) {
        let future = (self.f)(head.body(IncomingBody::new(body)));
        let scheduler = response.scheduler().clone();
        let task = scheduler.spawn_io(future);

        scheduler.spawn_io(async move {
            match task.await {
                Ok(Ok(resp)) => {
                    if let Err(e) = response.send(resp) {
                        error!(cause = %e, "failed to send response");
                    }
                }
                Ok(Err(e)) => {
                    let e = e.into();
                    error!(cause = %e, "request handler failed");
                    response.abort(e);
                }
                Err(e) => {
                    error!(cause = %e, "request handler panicked");
                    response.abort(e);
                }
            }
        });
    }
}

pub fn make_handler<F, Fut, RespBody, Err>(f: F) -> HandlerFn<F>
where
    F: Fn(Request<IncomingBody>) -> Fut,
    Fut: Future<Output = Result<Response<RespBody>, Err>>,
    RespBody: Body,
    Err: Into<BoxError>,
{
    HandlerFn { f }
}
