use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use strand_net::{BoxError, DataConsumer, DataProducer, Delivery, Resume, Subscription, lock};
use tokio::sync::mpsc;

use crate::body::RequestBody;

type Item = Result<Bytes, BoxError>;

/// A [`RequestBody`] read through the [`http_body::Body`] interface.
///
/// Chunks travel over a channel to whichever task polls the body. A chunk that
/// arrived with a continuation keeps the socket paused until the poller has
/// drained the channel, so an unread body never piles up in memory.
pub struct IncomingBody {
    receiver: mpsc::UnboundedReceiver<Item>,
    waiting: Arc<Mutex<Option<Resume>>>,
    subscription: Option<Subscription>,
    done: bool,
}

impl IncomingBody {
    pub fn new(body: RequestBody) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let waiting = Arc::new(Mutex::new(None));
        let forward = Forward { sender: Some(sender), waiting: Arc::clone(&waiting) };
        let subscription = Box::new(body).connect(Box::new(forward));
        Self { receiver, waiting, subscription: Some(subscription), done: false }
    }

    fn release(&self) {
        let resume = lock(&self.waiting).take();
        if let Some(resume) = resume {
            resume.resume();
        }
    }
}

impl Body for IncomingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if self.done {
            return Poll::Ready(None);
        }

        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(item)) => {
                if self.receiver.is_empty() {
                    self.release();
                }
                if item.is_err() {
                    self.done = true;
                }
                Poll::Ready(Some(item.map(Frame::data)))
            }
            Poll::Ready(None) => {
                self.done = true;
                self.subscription = None;
                Poll::Ready(None)
            }
            Poll::Pending => {
                self.release();
                Poll::Pending
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

impl Drop for IncomingBody {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
    }
}

impl fmt::Debug for IncomingBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingBody").field("done", &self.done).finish_non_exhaustive()
    }
}

struct Forward {
    sender: Option<mpsc::UnboundedSender<Item>>,
    waiting: Arc<Mutex<Option<Resume>>>,
}

impl DataConsumer for Forward {
    fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> Delivery {
        let Some(sender) = &self.sender else {
            return Delivery::Accepted;
        };
        if sender.send(Ok(data)).is_err() {
            return Delivery::Accepted;
        }
        match resume {
            Some(resume) => {
                *lock(&self.waiting) = Some(resume);
                Delivery::Deferred
            }
            None => Delivery::Accepted,
        }
    }

    fn on_error(&mut self, error: BoxError) {
        if let Some(sender) = self.sender.take() {
            let _ignored = sender.send(Err(error));
        }
    }

    fn on_end(&mut self) {
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn forward() -> (Forward, mpsc::UnboundedReceiver<Item>, Arc<Mutex<Option<Resume>>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let waiting = Arc::new(Mutex::new(None));
        (Forward { sender: Some(sender), waiting: Arc::clone(&waiting) }, receiver, waiting)
    }

    #[test]
    fn deferrable_chunks_park_the_continuation() {
        let (mut forward, mut receiver, waiting) = forward();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let resume = Resume::new(move || flag.store(true, Ordering::SeqCst));
        let delivery = forward.on_data(Bytes::from_static(b"a"), Some(resume));
        assert_eq!(delivery, Delivery::Deferred);
        assert!(waiting.lock().unwrap().is_some());

        assert_eq!(forward.on_data(Bytes::from_static(b"b"), None), Delivery::Accepted);
        forward.on_end();

        assert_eq!(receiver.try_recv().unwrap().unwrap(), "a");
        assert_eq!(receiver.try_recv().unwrap().unwrap(), "b");
        let _ = receiver.try_recv().unwrap_err();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn error_closes_the_channel() {
        let (mut forward, mut receiver, _waiting) = forward();
        forward.on_error("boom".into());
        forward.on_end();

        let _ = receiver.try_recv().unwrap().unwrap_err();
        let _ = receiver.try_recv().unwrap_err();
        assert_eq!(forward.on_data(Bytes::from_static(b"late"), None), Delivery::Accepted);
    }
}
