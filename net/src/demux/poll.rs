use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace};

use super::Demux;
use crate::dispatch::{Dispatcher, Ready, Registration};
use crate::timestamp::Timestamp;

/// Alternate demultiplexer backed by plain `poll(2)`.
///
/// Exists for interface parity on hosts where the scalable poller is
/// unwanted; selected with the `RIPTIDE_USE_POLL` environment variable.
/// There is no kernel-side registration to maintain, so `update`/`remove`
/// only drive the shared registration state machine and the descriptor set
/// is rebuilt from the fd map each cycle.
pub struct PollDemux {
    dispatchers: HashMap<RawFd, Arc<Dispatcher>>,
    // Scratch rebuilt every cycle.
    pollfds: Vec<libc::pollfd>,
}

impl Default for PollDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl PollDemux {
    pub fn new() -> Self {
        PollDemux {
            dispatchers: HashMap::new(),
            pollfds: Vec::new(),
        }
    }
}

impl Demux for PollDemux {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Dispatcher>>) -> Timestamp {
        self.pollfds.clear();
        for (fd, dispatcher) in &self.dispatchers {
            if dispatcher.registration() != Registration::Added {
                continue;
            }
            let interest = dispatcher.interest();
            let mut events: libc::c_short = 0;
            if interest.is_readable() {
                events |= libc::POLLIN | libc::POLLPRI;
            }
            if interest.is_writable() {
                events |= libc::POLLOUT;
            }
            if events == 0 {
                continue;
            }
            self.pollfds.push(libc::pollfd {
                fd: *fd,
                events,
                revents: 0,
            });
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout.as_millis() as libc::c_int,
            )
        };
        let now = Timestamp::now();

        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                debug!("poll interrupted by signal");
            } else {
                error!(%e, "poll failed");
                panic!("demux poll failed: {e}");
            }
            return now;
        }
        if n == 0 {
            trace!("poll timed out");
            return now;
        }

        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            let Some(dispatcher) = self.dispatchers.get(&pfd.fd) else {
                continue;
            };
            dispatcher.set_ready(Ready::new(
                pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0,
                pfd.revents & libc::POLLOUT != 0,
                pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                pfd.revents & libc::POLLHUP != 0,
            ));
            active.push(dispatcher.clone());
        }
        now
    }

    fn update(&mut self, dispatcher: &Arc<Dispatcher>) {
        let fd = dispatcher.fd();
        let interest = dispatcher.interest();
        match dispatcher.registration() {
            Registration::New | Registration::Deleted => {
                if interest.is_empty() {
                    return;
                }
                if dispatcher.registration() == Registration::New {
                    self.dispatchers.insert(fd, dispatcher.clone());
                }
                dispatcher.set_registration(Registration::Added);
            }
            Registration::Added => {
                if interest.is_empty() {
                    dispatcher.set_registration(Registration::Deleted);
                }
                // Non-empty interest is picked up from the dispatcher when
                // the descriptor set is rebuilt; nothing to reconcile here.
            }
        }
    }

    fn remove(&mut self, dispatcher: &Arc<Dispatcher>) {
        self.dispatchers.remove(&dispatcher.fd());
        dispatcher.set_registration(Registration::New);
    }
}
