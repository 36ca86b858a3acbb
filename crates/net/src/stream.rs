//! Push-based streaming capabilities with backpressure.
//!
//! Both the socket read path and HTTP bodies are expressed with the same pair of
//! traits: a [`DataProducer`] is connected to a [`DataConsumer`] and pushes chunks
//! into it. Each chunk may come with a [`Resume`] handle; the consumer answers
//! with a [`Delivery`] that tells the producer whether it may continue right away
//! or has to wait for the handle to fire.

use bytes::Bytes;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::scheduler::SchedulerHandle;

pub type BoxError = Box<dyn Error + Send + Sync>;

type Action = Box<dyn FnOnce() + Send>;

/// The consumer's answer to an offered chunk.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The chunk was taken, the producer may continue immediately.
    Accepted,
    /// The consumer kept the [`Resume`] handle and will fire it when ready.
    Deferred,
}

impl Delivery {
    #[inline]
    pub fn is_deferred(self) -> bool {
        matches!(self, Delivery::Deferred)
    }
}

/// A one-shot continuation.
///
/// Cloning a `Resume` shares the same one-shot: whichever clone fires first runs
/// the action, every later [`resume`](Resume::resume) or [`disarm`](Resume::disarm)
/// is a no-op. This makes "invoke a continuation at most once" hold no matter
/// how many parties keep a copy.
#[derive(Clone)]
pub struct Resume {
    action: Arc<Mutex<Option<Action>>>,
}

impl Resume {
    /// Creates a handle that runs `f` inline on the thread that fires it.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { action: Arc::new(Mutex::new(Some(Box::new(f)))) }
    }

    /// Creates a handle that posts `f` onto the scheduler when fired.
    ///
    /// The engine hands out posted handles only, so firing one from any thread
    /// (or from inside a callback) never re-enters engine state directly.
    pub fn posted<F>(scheduler: &SchedulerHandle, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = scheduler.clone();
        Self::new(move || scheduler.post(f))
    }

    /// A handle with nothing to resume.
    pub fn noop() -> Self {
        Self { action: Arc::new(Mutex::new(None)) }
    }

    /// Fires the continuation if no clone fired or disarmed it before.
    pub fn resume(&self) {
        let action = lock(&self.action).take();
        if let Some(action) = action {
            action();
        }
    }

    /// Disarms the continuation without running it.
    ///
    /// Returns `true` if the handle was still armed. A producer whose consumer
    /// answered [`Delivery::Accepted`] disarms its own copy and continues only when
    /// this returns `true`; otherwise the consumer already fired it.
    pub fn disarm(&self) -> bool {
        lock(&self.action).take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.action).is_some()
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume").field("armed", &self.is_armed()).finish()
    }
}

/// Receives chunks pushed by a [`DataProducer`].
pub trait DataConsumer: Send {
    /// Offers one chunk.
    ///
    /// When `resume` is `None` the chunk is already resident and the consumer can
    /// not apply backpressure: the return value is ignored by the producer.
    fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> Delivery;

    fn on_error(&mut self, error: BoxError);

    fn on_end(&mut self);
}

/// Something that pushes chunks into a [`DataConsumer`] once connected.
pub trait DataProducer: Send {
    fn connect(self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Subscription;
}

/// Handle returned by [`DataProducer::connect`]; cancelling it disconnects the
/// consumer.
///
/// Dropping a subscription does not cancel it.
#[must_use = "dropping a subscription does not cancel it"]
pub struct Subscription {
    cancel: Option<Action>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { cancel: Some(Box::new(cancel)) }
    }

    /// A subscription with nothing to cancel.
    pub fn empty() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("cancellable", &self.cancel.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_resume() -> (Resume, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let resume = Resume::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (resume, count)
    }

    #[test]
    fn clones_share_one_shot() {
        let (resume, count) = counting_resume();
        let copy = resume.clone();

        copy.resume();
        resume.resume();
        copy.resume();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!resume.is_armed());
    }

    #[test]
    fn disarm_prevents_firing() {
        let (resume, count) = counting_resume();
        let copy = resume.clone();

        assert!(resume.disarm());
        copy.resume();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!copy.disarm());
    }

    #[test]
    fn disarm_after_fire_reports_false() {
        let (resume, count) = counting_resume();
        resume.clone().resume();
        assert!(!resume.disarm());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_is_never_armed() {
        let resume = Resume::noop();
        assert!(!resume.is_armed());
        resume.resume();
    }

    #[test]
    fn subscription_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.cancel();
        Subscription::empty().cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
