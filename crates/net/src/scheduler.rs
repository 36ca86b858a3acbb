//! The run loop that serializes all engine activity.
//!
//! A [`Scheduler`] owns a FIFO of posted work items and a dedicated worker thread
//! that executes them one at a time. Nothing inside the engine runs concurrently
//! with anything else: socket completions produced by the I/O driver are posted
//! back onto the queue before they touch connection state.
//!
//! The I/O driver is a tokio runtime owned by the scheduler. It only performs
//! socket operations; engine logic never runs on its threads.
//!
//! # Example
//!
//! ```
//! use std::sync::mpsc;
//! use strand_net::Scheduler;
//!
//! let scheduler = Scheduler::builder().build().unwrap();
//! let (tx, rx) = mpsc::channel();
//!
//! // posting before start is fine, the item waits in the queue
//! scheduler.handle().post(move || tx.send(42).unwrap());
//! scheduler.start().unwrap();
//!
//! assert_eq!(rx.recv().unwrap(), 42);
//! ```

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{self, Runtime};
use tracing::{debug, error, trace};

use crate::SchedulerError;
use crate::lock;

type Work = Box<dyn FnOnce() + Send>;
type PanicHandler = Arc<dyn Fn(WorkPanic) + Send + Sync>;

/// A panic that escaped a posted work item.
#[derive(Debug, Clone, Error)]
#[error("posted work panicked: {message}")]
pub struct WorkPanic {
    message: String,
}

impl WorkPanic {
    /// Extracts the message of a payload caught by `catch_unwind`.
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct QueueState {
    work: VecDeque<Work>,
    phase: Phase,
    worker: Option<ThreadId>,
}

struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
    panic_handler: PanicHandler,
}

/// A cheap, clonable handle used to post work onto a [`Scheduler`].
///
/// Every engine object keeps one of these; it is passed explicitly rather than
/// looked up from ambient state.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
    io: runtime::Handle,
}

impl SchedulerHandle {
    /// Enqueues a unit of work and wakes the run loop.
    ///
    /// Safe to call before [`Scheduler::start`]. Work posted after a stop was
    /// requested is dropped without running.
    pub fn post<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = lock(&self.shared.state);
        match state.phase {
            Phase::Idle | Phase::Running => {
                state.work.push_back(Box::new(work));
                drop(state);
                self.shared.ready.notify_one();
            }
            Phase::Stopping | Phase::Stopped => {
                trace!("scheduler is stopping, dropping posted work");
            }
        }
    }

    /// Posts `work` once `delay` has elapsed on the I/O driver's clock.
    pub fn post_after<F>(&self, delay: Duration, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.clone();
        self.io.spawn(async move {
            tokio::time::sleep(delay).await;
            handle.post(work);
        });
    }

    /// Requests the run loop to drain the queue and exit.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut state = lock(&self.shared.state);
        match state.phase {
            Phase::Running => {
                state.phase = Phase::Stopping;
                drop(state);
                self.shared.ready.notify_all();
                debug!("scheduler stop requested");
                Ok(())
            }
            Phase::Idle | Phase::Stopping | Phase::Stopped => Err(SchedulerError::NotRunning),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.state).phase == Phase::Running
    }

    /// Returns `true` when called from the scheduler's worker thread.
    pub fn is_worker_thread(&self) -> bool {
        lock(&self.shared.state).worker == Some(thread::current().id())
    }

    /// Runs a socket future on the I/O driver.
    ///
    /// The future must only perform I/O; its outcome has to be posted back with
    /// [`post`](Self::post) before it touches engine state.
    pub fn spawn_io<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io.spawn(future)
    }

    /// The I/O driver's runtime handle.
    pub fn io(&self) -> &runtime::Handle {
        &self.io
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("SchedulerHandle")
            .field("phase", &state.phase)
            .field("queued", &state.work.len())
            .finish()
    }
}

/// The single-threaded run loop.
///
/// Dropping the scheduler stops it, joins the worker thread and shuts the I/O
/// driver down.
pub struct Scheduler {
    handle: SchedulerHandle,
    runtime: Option<Runtime>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// Starts executing queued work in FIFO order on a dedicated thread.
    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let mut state = lock(&self.handle.shared.state);
            if state.phase != Phase::Idle {
                return Err(SchedulerError::AlreadyStarted);
            }
            state.phase = Phase::Running;
        }

        let shared = Arc::clone(&self.handle.shared);
        let io = self.handle.io.clone();
        let spawned = thread::Builder::new().name("strand-scheduler".into()).spawn(move || {
            let _io = io.enter();
            run(&shared);
        });

        match spawned {
            Ok(join) => {
                *lock(&self.worker) = Some(join);
                debug!("scheduler started");
                Ok(())
            }
            Err(e) => {
                lock(&self.handle.shared.state).phase = Phase::Idle;
                Err(e.into())
            }
        }
    }

    /// Requests the run loop to drain the queue and exit.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        self.handle.stop()
    }

    /// Stops the loop if it is running and waits for the worker to exit.
    ///
    /// Calling this from inside a work item does not wait, the worker exits once
    /// the current item returns and the queue is drained.
    pub fn dispose(&self) {
        let _ = self.handle.stop();
        let join = lock(&self.worker).take();
        if let Some(join) = join {
            if join.thread().id() == thread::current().id() {
                return;
            }
            if join.join().is_err() {
                error!("scheduler worker exited abnormally");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.dispose();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("handle", &self.handle).finish_non_exhaustive()
    }
}

fn run(shared: &Shared) {
    lock(&shared.state).worker = Some(thread::current().id());

    loop {
        let work = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(work) = state.work.pop_front() {
                    break work;
                }
                if state.phase == Phase::Stopping {
                    state.phase = Phase::Stopped;
                    state.worker = None;
                    debug!("scheduler stopped");
                    return;
                }
                state = shared.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(work)) {
            (shared.panic_handler)(WorkPanic::from_payload(payload.as_ref()));
        }
    }
}

/// Configures and builds a [`Scheduler`].
pub struct SchedulerBuilder {
    io_threads: usize,
    panic_handler: Option<PanicHandler>,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self { io_threads: 1, panic_handler: None }
    }

    /// Number of threads the I/O driver uses for socket operations.
    pub fn io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads.max(1);
        self
    }

    /// Installs the handler that receives panics escaping posted work.
    ///
    /// By default they are logged at error level.
    pub fn panic_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(WorkPanic) + Send + Sync + 'static,
    {
        self.panic_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(self.io_threads)
            .thread_name("strand-io")
            .enable_all()
            .build()?;

        let panic_handler = self.panic_handler.unwrap_or_else(|| {
            Arc::new(|panic: WorkPanic| error!(cause = %panic, "unhandled panic in scheduled work"))
        });

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState { work: VecDeque::new(), phase: Phase::Idle, worker: None }),
            ready: Condvar::new(),
            panic_handler,
        });

        Ok(Scheduler {
            handle: SchedulerHandle { shared, io: runtime.handle().clone() },
            runtime: Some(runtime),
            worker: Mutex::new(None),
        })
    }
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("io_threads", &self.io_threads)
            .field("panic_handler", &self.panic_handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn panic_message_is_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(WorkPanic::from_payload(payload.as_ref()).message(), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(WorkPanic::from_payload(payload.as_ref()).message(), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(WorkPanic::from_payload(payload.as_ref()).message(), "non-string panic payload");
    }

    #[test]
    fn start_twice_fails() {
        let scheduler = Scheduler::builder().build().unwrap();
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyStarted)));
    }

    #[test]
    fn stop_before_start_fails() {
        let scheduler = Scheduler::builder().build().unwrap();
        assert!(matches!(scheduler.stop(), Err(SchedulerError::NotRunning)));
    }

    #[test]
    fn worker_thread_is_detected() {
        let scheduler = Scheduler::builder().build().unwrap();
        scheduler.start().unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = scheduler.handle().clone();
        scheduler.handle().post(move || tx.send(handle.is_worker_thread()).unwrap());

        assert!(rx.recv().unwrap());
        assert!(!scheduler.handle().is_worker_thread());
    }
}
