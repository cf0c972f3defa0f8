use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::callbacks::Task;
use crate::demux::{self, Demux};
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::metrics::{LOOP_TASKS, LOOP_WAKEUPS};

/// How long one poll cycle may block before the loop re-checks its flags.
const POLL_TIMEOUT: Duration = Duration::from_millis(10_000);

thread_local! {
    // One event loop per thread, enforced at construction.
    static LOOP_IN_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A single-threaded reactor: one readiness demultiplexer, one deferred-task
/// queue, one self-notification descriptor.
///
/// The thread that calls [`EventLoop::new`] owns the loop. Only that thread
/// may run it or mutate dispatchers; any other thread interacts exclusively
/// through [`run_on_loop`](EventLoop::run_on_loop) /
/// [`enqueue`](EventLoop::enqueue), which wake the loop out of its blocking
/// poll via an eventfd write.
pub struct EventLoop {
    thread: ThreadId,
    demux: Mutex<Box<dyn Demux>>,
    pending: Mutex<Vec<Task>>,
    calling_pending: AtomicBool,
    looping: AtomicBool,
    quit: AtomicBool,
    wakeup_fd: OwnedFd,
    wakeup_dispatcher: Arc<Dispatcher>,
}

impl EventLoop {
    /// Build a loop owned by the current thread.
    ///
    /// Panics if this thread already owns a loop.
    pub fn new() -> Result<Arc<EventLoop>, Error> {
        let demux = demux::new_default()?;
        let wakeup_fd = create_eventfd()?;
        let raw_wakeup = wakeup_fd.as_raw_fd();

        LOOP_IN_THREAD.with(|slot| {
            if slot.get() {
                error!(thread = ?thread::current().id(), "second event loop on one thread");
                panic!("an EventLoop already exists on this thread");
            }
            slot.set(true);
        });

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            thread: thread::current().id(),
            demux: Mutex::new(demux),
            pending: Mutex::new(Vec::new()),
            calling_pending: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            wakeup_fd,
            wakeup_dispatcher: Dispatcher::new(weak.clone(), raw_wakeup),
        });

        // Drain the 8-byte counter; the next wakeup write re-arms
        // readiness.
        event_loop
            .wakeup_dispatcher
            .set_read_callback(Arc::new(move |_at| {
                let mut value = 0u64;
                let n = unsafe {
                    libc::read(raw_wakeup, &mut value as *mut u64 as *mut libc::c_void, 8)
                };
                if n != 8 {
                    error!(n, "wakeup read returned unexpected length");
                }
            }));
        event_loop.wakeup_dispatcher.enable_read();

        debug!(thread = ?event_loop.thread, "event loop created");
        Ok(event_loop)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop owned by {:?} touched from {:?}",
            self.thread,
            thread::current().id()
        );
    }

    /// Run until [`quit`](EventLoop::quit). Poll, dispatch every ready
    /// descriptor with the cycle's timestamp, then drain deferred tasks.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        debug!(thread = ?self.thread, "event loop running");

        let mut active: Vec<Arc<Dispatcher>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let at = self.demux.lock().poll(POLL_TIMEOUT, &mut active);
            trace!(ready = active.len(), "poll returned");
            for dispatcher in &active {
                dispatcher.handle_event(at);
            }
            self.run_pending_tasks();
        }

        self.looping.store(false, Ordering::Release);
        debug!(thread = ?self.thread, "event loop stopped");
    }

    /// Ask the loop to exit at its next cycle boundary. Safe from any
    /// thread; an off-thread caller also wakes the blocking poll.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    /// Run `task` on the loop thread: synchronously when already there,
    /// otherwise deferred to the next cycle.
    pub fn run_on_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.enqueue(task);
        }
    }

    /// Append `task` to the deferred queue. Wakes the loop when called from
    /// another thread, and also when the loop is mid-drain so the new task
    /// does not sit through a full poll interval.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wake();
        }
    }

    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // Swap the queue out so tasks run without the lock held and
        // reentrant enqueues land in a fresh queue.
        let tasks = std::mem::take(&mut *self.pending.lock());
        LOOP_TASKS.add(tasks.len() as u64);
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    fn wake(&self) {
        LOOP_WAKEUPS.increment();
        let value = 1u64;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!(n, "wakeup write returned unexpected length");
        }
    }

    /// Forward an interest-set change to the demultiplexer. Loop thread only.
    pub fn update_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        self.assert_in_loop_thread();
        self.demux.lock().update(dispatcher);
    }

    /// Drop a dispatcher from the demultiplexer. Loop thread only.
    pub fn remove_dispatcher(&self, dispatcher: &Arc<Dispatcher>) {
        self.assert_in_loop_thread();
        self.demux.lock().remove(dispatcher);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Free the thread for a future loop, but only when dropped on the
        // owning thread; the eventfd and demultiplexer close themselves.
        if thread::current().id() == self.thread {
            LOOP_IN_THREAD.with(|slot| slot.set(false));
        }
    }
}

fn create_eventfd() -> Result<OwnedFd, Error> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
