//! A single-threaded, event-driven TCP socket engine
//!
//! This crate provides the transport half of the strand HTTP server: a run loop
//! that serializes every piece of engine logic onto one thread of control, a
//! TCP connection state machine with explicit backpressure, and a listener that
//! accounts for the connections it hands out.
//!
//! # Architecture
//!
//! - [`scheduler`]: the run loop. Work is posted as closures and executed in FIFO
//!   order on a dedicated worker thread. Real socket I/O is driven by a tokio
//!   runtime owned by the scheduler, and every I/O completion is re-posted onto
//!   the run loop before it touches connection state.
//! - [`buffer`]: the [`OutputBuffer`] holding bytes accepted by a connection but
//!   not yet flushed to the socket.
//! - [`stream`]: the push-based streaming capabilities shared by sockets and
//!   HTTP bodies: [`DataConsumer`], [`DataProducer`], [`Resume`] and [`Delivery`].
//! - [`connection`]: one TCP socket with its lifecycle state machine.
//! - [`listener`]: a bound server socket that accepts connections and raises a
//!   closed notification once the last of them is gone after a close request.
//!
//! # Backpressure
//!
//! A producer hands each chunk to its consumer together with an optional
//! [`Resume`] handle. A consumer that returns [`Delivery::Deferred`] promises to
//! fire the handle once it is ready for more; a consumer that returns
//! [`Delivery::Accepted`] lets the producer continue immediately. A chunk offered
//! without a handle can not be deferred.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use strand_net::{
//!     Connection, ConnectionHandler, Delivery, Listener, ListenerConfig, ListenerHandler, Resume, Scheduler,
//! };
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_data(&self, connection: &Connection, data: Bytes, resume: Resume) -> Delivery {
//!         connection.write(data, Some(resume)).unwrap_or(Delivery::Accepted)
//!     }
//!
//!     fn on_end(&self, connection: &Connection) {
//!         let _ = connection.end();
//!     }
//!
//!     fn on_closed(&self, connection: &Connection) {
//!         connection.dispose();
//!     }
//! }
//!
//! struct Accept;
//!
//! impl ListenerHandler for Accept {
//!     fn on_connection(&self, _connection: &Connection) -> Option<Arc<dyn ConnectionHandler>> {
//!         Some(Arc::new(Echo))
//!     }
//! }
//!
//! let scheduler = Scheduler::builder().build().unwrap();
//! scheduler.start().unwrap();
//!
//! let listener = Listener::new(scheduler.handle(), Arc::new(Accept), ListenerConfig::default());
//! listener.listen("127.0.0.1:8080".parse().unwrap()).unwrap();
//! ```

pub mod buffer;
pub mod connection;
pub mod listener;
pub mod scheduler;
pub mod stream;

mod config;
mod error;

pub use buffer::OutputBuffer;
pub use config::ListenerConfig;
pub use connection::{Connection, ConnectionHandler, ConnectionId, ConnectionState};
pub use error::{NetError, SchedulerError};
pub use listener::{Listener, ListenerHandler, ListenerState};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerHandle, WorkPanic};
pub use stream::{BoxError, DataConsumer, DataProducer, Delivery, Resume, Subscription};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the guard if a panicking work item poisoned it.
///
/// Work items run under `catch_unwind`, so a poisoned lock only means a panic was
/// already reported through the scheduler's panic handler.
#[doc(hidden)]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
