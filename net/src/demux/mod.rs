//! Readiness demultiplexers.
//!
//! The loop talks to the kernel through the [`Demux`] trait. The default
//! backend rides mio's scalable poller (epoll on Linux); setting
//! [`USE_POLL_ENV`] in the environment selects a plain `poll(2)` backend
//! with identical registration semantics.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::timestamp::Timestamp;

mod mio;
mod poll;

pub use self::mio::MioDemux;
pub use self::poll::PollDemux;

/// Environment variable selecting the `poll(2)` backend.
pub const USE_POLL_ENV: &str = "RIPTIDE_USE_POLL";

/// A readiness demultiplexer: tracks which descriptors are registered for
/// which events and reports the ready set each cycle.
///
/// Invariants shared by every backend:
/// - a dispatcher's fd has a kernel registration iff its registration state
///   is `Added`;
/// - a `Deleted` dispatcher stays in the fd map until `remove` erases it;
/// - interest mutations reach the kernel synchronously through `update`.
pub trait Demux: Send {
    /// Block up to `timeout` for readiness. Every ready dispatcher has its
    /// last-reported event set updated and is appended to `active`. Returns
    /// the wall-clock time at which the wait returned; on timeout `active`
    /// is left untouched.
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Dispatcher>>) -> Timestamp;

    /// Reconcile the dispatcher's interest set with the kernel.
    fn update(&mut self, dispatcher: &Arc<Dispatcher>);

    /// Erase the dispatcher from the fd map, deregistering first if needed.
    fn remove(&mut self, dispatcher: &Arc<Dispatcher>);
}

/// Build the backend selected by the environment.
pub fn new_default() -> Result<Box<dyn Demux>, Error> {
    if std::env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollDemux::new()))
    } else {
        Ok(Box::new(MioDemux::new()?))
    }
}
