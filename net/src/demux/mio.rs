use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use tracing::{debug, error, trace};

use super::Demux;
use crate::dispatch::{Dispatcher, Interest, Ready, Registration};
use crate::error::Error;
use crate::timestamp::Timestamp;

const INITIAL_EVENT_CAPACITY: usize = 16;

/// Default demultiplexer, backed by mio (epoll on Linux, kqueue on the BSDs).
pub struct MioDemux {
    poll: Poll,
    events: Events,
    dispatchers: HashMap<RawFd, Arc<Dispatcher>>,
}

impl MioDemux {
    pub fn new() -> Result<Self, Error> {
        let poll = Poll::new().map_err(|e| Error::Setup(format!("mio poll: {e}")))?;
        Ok(MioDemux {
            poll,
            events: Events::with_capacity(INITIAL_EVENT_CAPACITY),
            dispatchers: HashMap::new(),
        })
    }

    fn register(&self, fd: RawFd, interest: Interest) {
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), mio_interest(interest))
        {
            error!(fd, %e, "demux register failed");
            panic!("demux register failed for fd {fd}: {e}");
        }
    }

    fn reregister(&self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.poll.registry().reregister(
            &mut SourceFd(&fd),
            Token(fd as usize),
            mio_interest(interest),
        ) {
            error!(fd, %e, "demux modify failed");
            panic!("demux modify failed for fd {fd}: {e}");
        }
    }

    fn deregister(&self, fd: RawFd) {
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            error!(fd, %e, "demux deregister failed");
        }
    }
}

impl Demux for MioDemux {
    fn poll(&mut self, timeout: Duration, active: &mut Vec<Arc<Dispatcher>>) -> Timestamp {
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!("poll interrupted by signal");
                return Timestamp::now();
            }
            Err(e) => {
                error!(%e, "poll failed");
                panic!("demux poll failed: {e}");
            }
        }
        let now = Timestamp::now();

        let mut used = 0;
        for event in self.events.iter() {
            used += 1;
            let fd = event.token().0 as RawFd;
            let Some(dispatcher) = self.dispatchers.get(&fd) else {
                trace!(fd, "readiness for unknown fd, dropped");
                continue;
            };
            dispatcher.set_ready(Ready::new(
                event.is_readable() || event.is_priority(),
                event.is_writable(),
                event.is_error(),
                event.is_read_closed() && event.is_write_closed(),
            ));
            active.push(dispatcher.clone());
        }

        // Every slot used this cycle: double the scratch for the next one.
        if used == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }
        now
    }

    fn update(&mut self, dispatcher: &Arc<Dispatcher>) {
        let fd = dispatcher.fd();
        let interest = dispatcher.interest();
        match dispatcher.registration() {
            Registration::New | Registration::Deleted => {
                if interest.is_empty() {
                    // mio cannot express an empty registration; the next
                    // interest change registers.
                    return;
                }
                if dispatcher.registration() == Registration::New {
                    self.dispatchers.insert(fd, dispatcher.clone());
                }
                self.register(fd, interest);
                dispatcher.set_registration(Registration::Added);
            }
            Registration::Added => {
                if interest.is_empty() {
                    self.deregister(fd);
                    dispatcher.set_registration(Registration::Deleted);
                } else {
                    self.reregister(fd, interest);
                }
            }
        }
    }

    fn remove(&mut self, dispatcher: &Arc<Dispatcher>) {
        let fd = dispatcher.fd();
        self.dispatchers.remove(&fd);
        if dispatcher.registration() == Registration::Added {
            self.deregister(fd);
        }
        dispatcher.set_registration(Registration::New);
    }
}

fn mio_interest(interest: Interest) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (true, false) => mio::Interest::READABLE,
        (false, true) => mio::Interest::WRITABLE,
        // update() never registers an empty set.
        (false, false) => unreachable!("empty interest set reached registration"),
    }
}
