use std::hint::black_box;

use bytes::{Bytes, BytesMut};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use http::{StatusCode, Version};
use strand_http::codec::{HeaderEncoder, RequestDecoder, ResponseEncoder};
use strand_http::protocol::{Message, PayloadItem, PayloadSize, status_head};
use strand_http::wire::{TransactionDelegate, WireParser};
use strand_http::RequestHead;
use strand_net::{Delivery, Resume};
use tokio_util::codec::{Decoder, Encoder};

const SMALL_GET: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

const LARGE_GET: &[u8] = b"GET /api/v1/users/42/profile?fields=name,email HTTP/1.1\r\n\
Host: example.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36\r\n\
Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Cookie: session=0123456789abcdef; theme=dark; tracking=off\r\n\
Cache-Control: no-cache\r\n\
Connection: keep-alive\r\n\r\n";

const CHUNKED_POST: &[u8] = b"POST /upload HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n";

struct Discard;

impl TransactionDelegate for Discard {
    fn on_request(&self, head: RequestHead, keep_alive: bool) {
        black_box((head, keep_alive));
    }

    fn on_request_data(&self, data: Bytes, _resume: Option<Resume>) -> Delivery {
        black_box(data);
        Delivery::Accepted
    }

    fn on_request_end(&self) {}
}

fn bench_request_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("request_decoder");

    for (name, input) in [("small_get", SMALL_GET), ("large_get", LARGE_GET)] {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            let mut decoder = RequestDecoder::new();
            b.iter_batched_ref(
                || BytesMut::from(input),
                |bytes| {
                    let header = decoder.decode(bytes).expect("valid request head");
                    let eof = decoder.decode(bytes).expect("valid empty body");
                    black_box((header, eof));
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_wire_parser(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("wire_parser");
    let pipelined = [SMALL_GET; 8].concat();

    for (name, input) in [("chunked_post", CHUNKED_POST), ("pipelined_gets", pipelined.as_slice())] {
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            let resume = Resume::noop();
            b.iter(|| {
                let mut parser = WireParser::new();
                parser.execute(input).expect("valid requests");
                black_box(parser.take_events().commit(&Discard, &resume));
            });
        });
    }

    group.finish();
}

fn bench_response_encoder(criterion: &mut Criterion) {
    let body = Bytes::from_static(b"Hello World!");

    criterion.bench_function("encode_chunked_response", |b| {
        b.iter_batched_ref(
            || {
                let encoder = ResponseEncoder::new(HeaderEncoder::new(Version::HTTP_11, true));
                (encoder, BytesMut::with_capacity(1024))
            },
            |(encoder, dst)| {
                encoder
                    .encode(Message::<_, Bytes>::Header((status_head(StatusCode::OK), PayloadSize::Chunked)), dst)
                    .expect("valid head");
                encoder.encode(Message::Payload(PayloadItem::Chunk(body.clone())), dst).expect("valid chunk");
                encoder.encode(Message::<_, Bytes>::Payload(PayloadItem::Eof), dst).expect("valid eof");
                black_box(dst);
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_request_decoder, bench_wire_parser, bench_response_encoder);
criterion_main!(benches);
