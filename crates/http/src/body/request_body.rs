//! The request body as seen by application code.
//!
//! The transaction pipeline pushes body chunks into a [`BodyChannel`] as they
//! are committed; the application connects to the matching [`RequestBody`]
//! whenever it likes. Chunks that arrive before it connects are held and
//! replayed on connect. If the last of them arrived with the read continuation,
//! the channel keeps that continuation, so the socket stays paused until the
//! application takes the data.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use strand_net::{BoxError, DataConsumer, DataProducer, Delivery, Resume, SchedulerHandle, Subscription, lock};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// No consumer connected yet
    Pending,
    Attached,
    /// The consumer disconnected, or the body was abandoned
    Cancelled,
    /// End or error was delivered
    Closed,
}

struct ChannelState {
    phase: Phase,
    consumer: Option<Box<dyn DataConsumer>>,
    buffered: VecDeque<Bytes>,
    held: Option<Resume>,
    ended: bool,
    error: Option<BoxError>,
}

/// Pipeline side of a request body.
///
/// Consumers are never invoked while the channel's lock is held.
#[derive(Clone)]
pub(crate) struct BodyChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl BodyChannel {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ChannelState {
                phase: Phase::Pending,
                consumer: None,
                buffered: VecDeque::new(),
                held: None,
                ended: false,
                error: None,
            })),
        }
    }

    /// Whether a consumer was ever connected, or the body was given up.
    pub(crate) fn is_claimed(&self) -> bool {
        lock(&self.state).phase != Phase::Pending
    }

    /// Offers one committed body chunk.
    pub(crate) fn push(&self, data: Bytes, resume: Option<Resume>) -> Delivery {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Pending => {
                state.buffered.push_back(data);
                match resume {
                    Some(resume) => {
                        state.held = Some(resume);
                        Delivery::Deferred
                    }
                    None => Delivery::Accepted,
                }
            }
            Phase::Attached => {
                let Some(mut consumer) = state.consumer.take() else {
                    return Delivery::Accepted;
                };
                drop(state);

                let delivery = consumer.on_data(data, resume.clone());
                if let (Delivery::Deferred, Some(resume)) = (delivery, resume) {
                    self.hold(resume);
                }
                self.restore(consumer);
                delivery
            }
            Phase::Cancelled | Phase::Closed => {
                trace!(size = data.len(), "discarding request body chunk");
                Delivery::Accepted
            }
        }
    }

    /// The request body ended.
    pub(crate) fn finish(&self) {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Pending => state.ended = true,
            Phase::Attached => {
                state.phase = Phase::Closed;
                let consumer = state.consumer.take();
                drop(state);
                if let Some(mut consumer) = consumer {
                    consumer.on_end();
                }
            }
            Phase::Cancelled | Phase::Closed => {}
        }
    }

    /// The request body can not complete.
    pub(crate) fn fail(&self, error: BoxError) {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Pending => {
                if !state.ended {
                    state.error = Some(error);
                }
            }
            Phase::Attached => {
                state.phase = Phase::Closed;
                let consumer = state.consumer.take();
                drop(state);
                if let Some(mut consumer) = consumer {
                    consumer.on_error(error);
                }
            }
            Phase::Cancelled | Phase::Closed => {}
        }
    }

    /// Drops the consumer and any held data, and lets the socket read on so
    /// the rest of the body is drained.
    pub(crate) fn cancel(&self) {
        let (consumer, held) = {
            let mut state = lock(&self.state);
            if matches!(state.phase, Phase::Cancelled | Phase::Closed) {
                return;
            }
            state.phase = Phase::Cancelled;
            state.buffered.clear();
            (state.consumer.take(), state.held.take())
        };
        drop(consumer);
        if let Some(held) = held {
            held.resume();
        }
    }

    /// Connects `consumer` and replays everything held so far.
    pub(crate) fn attach(&self, mut consumer: Box<dyn DataConsumer>) {
        let (chunks, held, ended, error) = {
            let mut state = lock(&self.state);
            if state.phase != Phase::Pending {
                trace!(phase = ?state.phase, "request body connected after it was given up");
                return;
            }
            state.phase = Phase::Attached;
            (mem::take(&mut state.buffered), state.held.take(), state.ended, state.error.take())
        };

        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            match &held {
                Some(held) if i + 1 == count => {
                    if consumer.on_data(chunk, Some(held.clone())).is_deferred() {
                        self.hold(held.clone());
                    } else {
                        held.resume();
                    }
                }
                _ => {
                    let _ignored = consumer.on_data(chunk, None);
                }
            }
        }
        if count == 0 {
            if let Some(held) = held {
                held.resume();
            }
        }

        if let Some(error) = error {
            lock(&self.state).phase = Phase::Closed;
            consumer.on_error(error);
        } else if ended {
            lock(&self.state).phase = Phase::Closed;
            consumer.on_end();
        } else {
            self.restore(consumer);
        }
    }

    /// Remembers a continuation the consumer deferred, so that cancelling
    /// releases the socket even if the consumer never fires it.
    fn hold(&self, resume: Resume) {
        let mut state = lock(&self.state);
        if state.phase == Phase::Attached {
            state.held = Some(resume);
        } else {
            drop(state);
            resume.resume();
        }
    }

    /// Puts a consumer back after calling it, unless it was disconnected meanwhile.
    fn restore(&self, consumer: Box<dyn DataConsumer>) {
        let mut state = lock(&self.state);
        if state.phase == Phase::Attached {
            state.consumer = Some(consumer);
        }
    }
}

impl fmt::Debug for BodyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("BodyChannel")
            .field("phase", &state.phase)
            .field("buffered", &state.buffered.len())
            .field("ended", &state.ended)
            .finish_non_exhaustive()
    }
}

/// The body of a request, handed to the [`RequestHandler`](crate::handler::RequestHandler).
///
/// Connect a [`DataConsumer`] to receive it. Dropping the body without
/// connecting discards it; the connection keeps reading so that pipelined
/// requests behind it are still served.
pub struct RequestBody {
    channel: Option<BodyChannel>,
    scheduler: SchedulerHandle,
}

impl RequestBody {
    pub(crate) fn new(channel: BodyChannel, scheduler: &SchedulerHandle) -> Self {
        Self { channel: Some(channel), scheduler: scheduler.clone() }
    }
}

impl DataProducer for RequestBody {
    fn connect(mut self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Subscription {
        let Some(channel) = self.channel.take() else {
            return Subscription::empty();
        };

        let attach = channel.clone();
        self.scheduler.post(move || attach.attach(consumer));

        let scheduler = self.scheduler.clone();
        Subscription::new(move || scheduler.post(move || channel.cancel()))
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.scheduler.post(move || channel.cancel());
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody").field("connected", &self.channel.is_none()).finish_non_exhaustive()
    }
}
