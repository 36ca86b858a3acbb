//! curl -v http://127.0.0.1:8080/
//! curl -v -H "Transfer-Encoding: chunked" -d "hello=world" http://127.0.0.1:8080/echo
//! curl -v http://127.0.0.1:8080/slow
//! curl -v -d 'anything' http://127.0.0.1:8081/

use std::error::Error;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use strand_http::protocol::status_head;
use strand_http::{
    BytesProducer, HttpServer, IncomingBody, RequestBody, RequestHead, ResponseSink, collect_body,
    make_handler,
};
use strand_net::Scheduler;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

fn route(head: RequestHead, body: RequestBody, response: ResponseSink) {
    info!(method = %head.method(), path = head.uri().path(), "receiving request");
    match head.uri().path() {
        "/echo" => echo(body, response),
        "/slow" => {
            let scheduler = response.scheduler().clone();
            scheduler.post_after(Duration::from_secs(1), move || reply(&response, StatusCode::OK, "finally\r\n"));
        }
        _ => reply(&response, StatusCode::OK, "Hello World!\r\n"),
    }
}

fn echo(body: RequestBody, response: ResponseSink) {
    let _subscription = collect_body(body, move |collected| match collected {
        Ok(data) => {
            info!(size = data.len(), "echoing request body");
            if response.respond(status_head(StatusCode::OK)).is_ok() {
                let _ = response.write_body(BytesProducer::new(data));
                let _ = response.end();
            }
        }
        Err(e) => response.abort(e),
    });
}

fn reply(response: &ResponseSink, status: StatusCode, text: &'static str) {
    let head = Response::builder().status(status).header(http::header::CONTENT_LENGTH, text.len()).body(());
    let result = head
        .map_err(|e| e.to_string())
        .and_then(|head| response.respond(head).map_err(|e| e.to_string()))
        .and_then(|()| response.write_body(BytesProducer::new(text)).map_err(|e| e.to_string()))
        .and_then(|()| response.end().map_err(|e| e.to_string()));
    if let Err(e) = result {
        error!(cause = %e, "failed to respond");
    }
}

async fn hello_async(request: Request<IncomingBody>) -> Result<Response<Full<Bytes>>, Box<dyn Error + Send + Sync>> {
    let body = request.into_body().collect().await?.to_bytes();
    info!(size = body.len(), "async handler received body");
    Ok(Response::new(Full::new(Bytes::from_static(b"Hello from async!\r\n"))))
}

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let scheduler = Scheduler::builder().build().expect("failed to build scheduler");
    scheduler.start().expect("failed to start scheduler");

    let plain = HttpServer::builder()
        .address("127.0.0.1:8080")
        .server_name("strand-hello")
        .handler(route)
        .build(scheduler.handle());
    let async_server =
        HttpServer::builder().address("127.0.0.1:8081").handler(make_handler(hello_async)).build(scheduler.handle());

    match (plain, async_server) {
        (Ok(plain), Ok(async_server)) => {
            info!(plain = ?plain.local_addr(), async_addr = ?async_server.local_addr(), "servers started");
            std::thread::park();
        }
        (Err(e), _) | (_, Err(e)) => error!(cause = %e, "failed to start server"),
    }

    scheduler.dispose();
}
