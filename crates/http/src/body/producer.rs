//! Ready-made [`DataProducer`]s for response bodies, and a collector for
//! request bodies.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use http_body::Body;
use http_body_util::BodyExt;
use strand_net::{BoxError, DataConsumer, DataProducer, Delivery, Resume, SchedulerHandle, Subscription, lock};
use tokio::select;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::body::RequestBody;

/// Produces one in-memory chunk, then ends.
#[derive(Debug, Clone, Default)]
pub struct BytesProducer {
    bytes: Bytes,
}

impl BytesProducer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }
}

impl DataProducer for BytesProducer {
    fn connect(self: Box<Self>, mut consumer: Box<dyn DataConsumer>) -> Subscription {
        if !self.bytes.is_empty() {
            let _ignored = consumer.on_data(self.bytes, None);
        }
        consumer.on_end();
        Subscription::empty()
    }
}

type SharedConsumer = Arc<Mutex<Option<Box<dyn DataConsumer>>>>;

/// Streams any [`http_body::Body`] into a consumer.
///
/// The body is polled on the scheduler's I/O driver; every frame is handed to
/// the consumer on the scheduler thread, and the next frame is only polled once
/// the consumer accepted the previous one or fired its [`Resume`].
pub struct BodyProducer<B> {
    body: B,
    scheduler: SchedulerHandle,
}

impl<B> BodyProducer<B> {
    pub fn new(scheduler: &SchedulerHandle, body: B) -> Self {
        Self { body, scheduler: scheduler.clone() }
    }
}

impl<B> fmt::Debug for BodyProducer<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyProducer").finish_non_exhaustive()
    }
}

impl<B> DataProducer for BodyProducer<B>
where
    B: Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Into<BoxError> + Send,
{
    fn connect(self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Subscription {
        let BodyProducer { mut body, scheduler } = *self;
        let consumer: SharedConsumer = Arc::new(Mutex::new(Some(consumer)));
        let token = CancellationToken::new();

        let task_consumer = Arc::clone(&consumer);
        let task_token = token.clone();
        let task_scheduler = scheduler.clone();
        scheduler.spawn_io(async move {
            loop {
                let frame = select! {
                    () = task_token.cancelled() => return,
                    frame = body.frame() => frame,
                };

                match frame {
                    None => {
                        deliver(&task_scheduler, &task_consumer, &task_token, |consumer| consumer.on_end());
                        return;
                    }
                    Some(Err(e)) => {
                        let error = e.into();
                        deliver(&task_scheduler, &task_consumer, &task_token, move |consumer| consumer.on_error(error));
                        return;
                    }
                    Some(Ok(frame)) => {
                        let Ok(mut data) = frame.into_data() else {
                            trace!("skipping body trailers");
                            continue;
                        };
                        if !data.has_remaining() {
                            continue;
                        }
                        let chunk = data.copy_to_bytes(data.remaining());

                        let (ready, accepted) = oneshot::channel::<()>();
                        let shared = Arc::clone(&task_consumer);
                        let offer_token = task_token.clone();
                        task_scheduler.post(move || offer(&shared, &offer_token, chunk, ready));

                        select! {
                            () = task_token.cancelled() => return,
                            outcome = accepted => {
                                if outcome.is_err() {
                                    // the consumer went away without resuming
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Subscription::new(move || {
            token.cancel();
            scheduler.post(move || drop(lock(&consumer).take()));
        })
    }
}

/// Hands one chunk to the consumer; `ready` is signalled once it may have more.
fn offer(consumer: &SharedConsumer, token: &CancellationToken, chunk: Bytes, ready: oneshot::Sender<()>) {
    if token.is_cancelled() {
        return;
    }
    let Some(mut taken) = lock(consumer).take() else {
        return;
    };

    let resume = Resume::new(move || {
        let _ignored = ready.send(());
    });
    if taken.on_data(chunk, Some(resume.clone())) == Delivery::Accepted {
        resume.resume();
    }

    if !token.is_cancelled() {
        *lock(consumer) = Some(taken);
    }
}

fn deliver<F>(scheduler: &SchedulerHandle, consumer: &SharedConsumer, token: &CancellationToken, notify: F)
where
    F: FnOnce(&mut dyn DataConsumer) + Send + 'static,
{
    let consumer = Arc::clone(consumer);
    let token = token.clone();
    scheduler.post(move || {
        if token.is_cancelled() {
            return;
        }
        let taken = lock(&consumer).take();
        if let Some(mut taken) = taken {
            notify(taken.as_mut());
        }
    });
}

/// Buffers a whole request body, then calls `done` on the scheduler thread.
pub fn collect_body<F>(body: RequestBody, done: F) -> Subscription
where
    F: FnOnce(Result<Bytes, BoxError>) + Send + 'static,
{
    Box::new(body).connect(Box::new(Collect { buffer: BytesMut::new(), done: Some(done) }))
}

struct Collect<F> {
    buffer: BytesMut,
    done: Option<F>,
}

impl<F> DataConsumer for Collect<F>
where
    F: FnOnce(Result<Bytes, BoxError>) + Send + 'static,
{
    fn on_data(&mut self, data: Bytes, _resume: Option<Resume>) -> Delivery {
        self.buffer.extend_from_slice(&data);
        Delivery::Accepted
    }

    fn on_error(&mut self, error: BoxError) {
        if let Some(done) = self.done.take() {
            done(Err(error));
        }
    }

    fn on_end(&mut self) {
        if let Some(done) = self.done.take() {
            done(Ok(self.buffer.split().freeze()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::mpsc;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use http_body::Frame;
    use strand_net::Scheduler;

    #[derive(Default)]
    struct Gather {
        chunks: Arc<Mutex<Vec<Bytes>>>,
        ended: Arc<Mutex<bool>>,
    }

    impl DataConsumer for Gather {
        fn on_data(&mut self, data: Bytes, _resume: Option<Resume>) -> Delivery {
            self.chunks.lock().unwrap().push(data);
            Delivery::Accepted
        }

        fn on_error(&mut self, _error: BoxError) {}

        fn on_end(&mut self) {
            *self.ended.lock().unwrap() = true;
        }
    }

    #[test]
    fn bytes_producer_delivers_once_then_ends() {
        let gather = Gather::default();
        let chunks = Arc::clone(&gather.chunks);
        let ended = Arc::clone(&gather.ended);

        let subscription = Box::new(BytesProducer::new("hello")).connect(Box::new(gather));
        subscription.cancel();

        assert_eq!(*chunks.lock().unwrap(), vec![Bytes::from_static(b"hello")]);
        assert!(*ended.lock().unwrap());
    }

    #[test]
    fn empty_bytes_producer_only_ends() {
        let gather = Gather::default();
        let chunks = Arc::clone(&gather.chunks);
        let ended = Arc::clone(&gather.ended);

        let _subscription = Box::new(BytesProducer::default()).connect(Box::new(gather));

        assert!(chunks.lock().unwrap().is_empty());
        assert!(*ended.lock().unwrap());
    }

    struct FailsAfter {
        chunk: Option<Bytes>,
    }

    impl Body for FailsAfter {
        type Data = Bytes;
        type Error = std::io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, std::io::Error>>> {
            Poll::Ready(Some(match self.chunk.take() {
                Some(chunk) => Ok(Frame::data(chunk)),
                None => Err(std::io::Error::other("broken source")),
            }))
        }
    }

    struct Report {
        events: mpsc::Sender<String>,
    }

    impl DataConsumer for Report {
        fn on_data(&mut self, data: Bytes, _resume: Option<Resume>) -> Delivery {
            let _ = self.events.send(format!("data {}", String::from_utf8_lossy(&data)));
            Delivery::Accepted
        }

        fn on_error(&mut self, error: BoxError) {
            let _ = self.events.send(format!("error {error}"));
        }

        fn on_end(&mut self) {
            let _ = self.events.send("end".to_string());
        }
    }

    #[test]
    fn body_producer_forwards_data_then_the_failure() {
        let scheduler = Scheduler::builder().build().unwrap();
        scheduler.start().unwrap();
        let (tx, rx) = mpsc::channel();

        let producer = BodyProducer::new(scheduler.handle(), FailsAfter { chunk: Some(Bytes::from_static(b"abc")) });
        let _subscription = Box::new(producer).connect(Box::new(Report { events: tx }));

        let timeout = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "data abc");
        assert_eq!(rx.recv_timeout(timeout).unwrap(), "error broken source");
        let _ = rx.recv_timeout(Duration::from_millis(100)).unwrap_err();

        scheduler.dispose();
    }
}
