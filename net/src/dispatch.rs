use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Interest set a dispatcher registers with the demultiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READ: Interest = Interest(1);
    pub const WRITE: Interest = Interest(2);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }
}

/// Readiness reported by one poll cycle for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready(u8);

impl Ready {
    pub const EMPTY: Ready = Ready(0);

    const READABLE: u8 = 1;
    const WRITABLE: u8 = 2;
    const ERROR: u8 = 4;
    const HANGUP: u8 = 8;

    pub fn new(readable: bool, writable: bool, error: bool, hangup: bool) -> Self {
        let mut bits = 0;
        if readable {
            bits |= Self::READABLE;
        }
        if writable {
            bits |= Self::WRITABLE;
        }
        if error {
            bits |= Self::ERROR;
        }
        if hangup {
            bits |= Self::HANGUP;
        }
        Ready(bits)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    pub fn is_hangup(self) -> bool {
        self.0 & Self::HANGUP != 0
    }
}

/// Where a dispatcher stands with respect to the demultiplexer's kernel
/// registration and fd map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Never registered; not in the fd map.
    New,
    /// Registered with the kernel and present in the fd map.
    Added,
    /// Deregistered from the kernel but still in the fd map.
    Deleted,
}

pub type ReadCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

struct State {
    interest: Interest,
    ready: Ready,
    registration: Registration,
    on_read: Option<ReadCallback>,
    on_write: Option<EventCallback>,
    on_close: Option<EventCallback>,
    on_error: Option<EventCallback>,
    tied: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

/// Per-descriptor binding of an interest set to readiness callbacks.
///
/// A dispatcher never owns its fd; the acceptor, connection, or loop that
/// created it does. Interest mutators must run on the owning loop's thread
/// because they synchronously reconcile with the demultiplexer.
pub struct Dispatcher {
    owner: Weak<EventLoop>,
    fd: RawFd,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            owner,
            fd,
            state: Mutex::new(State {
                interest: Interest::NONE,
                ready: Ready::EMPTY,
                registration: Registration::New,
                on_read: None,
                on_write: None,
                on_close: None,
                on_error: None,
                tied: false,
                tie: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub fn interest(&self) -> Interest {
        self.state.lock().interest
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn registration(&self) -> Registration {
        self.state.lock().registration
    }

    /// Demultiplexer-side: record the registration state transition.
    pub fn set_registration(&self, registration: Registration) {
        self.state.lock().registration = registration;
    }

    /// Demultiplexer-side: record the events this poll cycle reported.
    pub fn set_ready(&self, ready: Ready) {
        self.state.lock().ready = ready;
    }

    pub fn set_read_callback(&self, cb: ReadCallback) {
        self.state.lock().on_read = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.state.lock().on_write = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.state.lock().on_close = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.state.lock().on_error = Some(cb);
    }

    /// Bind handler execution to `owner`'s liveness: once the owner is gone,
    /// events for this dispatcher are dropped instead of dispatched.
    pub fn tie(&self, owner: Arc<dyn Any + Send + Sync>) {
        let mut state = self.state.lock();
        state.tie = Some(Arc::downgrade(&owner));
        state.tied = true;
    }

    pub fn enable_read(self: &Arc<Self>) {
        self.state.lock().interest.insert(Interest::READ);
        self.update();
    }

    pub fn disable_read(self: &Arc<Self>) {
        self.state.lock().interest.remove(Interest::READ);
        self.update();
    }

    pub fn enable_write(self: &Arc<Self>) {
        self.state.lock().interest.insert(Interest::WRITE);
        self.update();
    }

    pub fn disable_write(self: &Arc<Self>) {
        self.state.lock().interest.remove(Interest::WRITE);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.state.lock().interest = Interest::NONE;
        self.update();
    }

    fn update(self: &Arc<Self>) {
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.update_dispatcher(self);
        }
    }

    /// Drop the demultiplexer's knowledge of this fd entirely.
    pub fn remove(self: &Arc<Self>) {
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.remove_dispatcher(self);
        }
    }

    /// Invoked by the loop for every dispatcher the demultiplexer reported.
    ///
    /// A tied dispatcher first promotes its weak guard; if the owner is gone
    /// the event is dropped. The guard stays alive across all callbacks so
    /// reentrant teardown cannot free the owner mid-dispatch.
    pub fn handle_event(&self, at: Timestamp) {
        let (tied, tie) = {
            let state = self.state.lock();
            (state.tied, state.tie.clone())
        };
        if tied {
            match tie.and_then(|weak| weak.upgrade()) {
                Some(_guard) => self.dispatch(at),
                None => trace!(fd = self.fd, "event after owner teardown, dropped"),
            }
        } else {
            self.dispatch(at);
        }
    }

    fn dispatch(&self, at: Timestamp) {
        // Callbacks are cloned out of the lock so they may re-enter interest
        // mutators on this same dispatcher.
        let (ready, on_read, on_write, on_close, on_error) = {
            let state = self.state.lock();
            (
                state.ready,
                state.on_read.clone(),
                state.on_write.clone(),
                state.on_close.clone(),
                state.on_error.clone(),
            )
        };

        if ready.is_hangup() && !ready.is_readable() {
            if let Some(cb) = &on_close {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = &on_error {
                cb();
            }
        }
        if ready.is_readable() {
            if let Some(cb) = &on_read {
                cb(at);
            }
        }
        if ready.is_writable() {
            if let Some(cb) = &on_write {
                cb();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_set_algebra() {
        let mut interest = Interest::NONE;
        assert!(interest.is_empty());
        interest.insert(Interest::READ);
        assert!(interest.is_readable() && !interest.is_writable());
        interest.insert(Interest::WRITE);
        assert!(interest.is_readable() && interest.is_writable());
        interest.remove(Interest::READ);
        assert!(!interest.is_readable() && interest.is_writable());
        interest.remove(Interest::WRITE);
        assert!(interest.is_empty());
    }

    #[test]
    fn interest_round_trip_restores_registration_state() {
        use std::os::fd::AsRawFd;

        let event_loop = crate::event_loop::EventLoop::new().unwrap();
        let (sock, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        let dispatcher = Dispatcher::new(Arc::downgrade(&event_loop), sock.as_raw_fd());

        assert_eq!(dispatcher.registration(), Registration::New);
        dispatcher.enable_read();
        assert_eq!(dispatcher.registration(), Registration::Added);
        assert!(dispatcher.is_reading());

        // Dropping the last interest deregisters but keeps the fd known.
        dispatcher.disable_all();
        assert_eq!(dispatcher.registration(), Registration::Deleted);
        assert!(dispatcher.interest().is_empty());

        dispatcher.enable_write();
        assert_eq!(dispatcher.registration(), Registration::Added);
        assert!(dispatcher.is_writing());

        dispatcher.remove();
        assert_eq!(dispatcher.registration(), Registration::New);
    }

    #[test]
    fn ready_bits_round_trip() {
        let ready = Ready::new(true, false, true, false);
        assert!(ready.is_readable());
        assert!(!ready.is_writable());
        assert!(ready.is_error());
        assert!(!ready.is_hangup());
        assert_eq!(Ready::EMPTY, Ready::new(false, false, false, false));
    }
}
