use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::callbacks::NewConnectionCallback;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics::CONNECTIONS_ACCEPTED;

/// Listener-side half of the server: a nonblocking listening socket and a
/// dispatcher on the base loop that drains the accept backlog on each
/// readable event.
///
/// The socket is created and bound in the constructor; `listen` arms it.
/// Runs only on the base loop's thread.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    dispatcher: Arc<Dispatcher>,
    listening: AtomicBool,
    on_new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let domain = Domain::for_address(listen_addr);
        // Close-on-exec comes with socket2's socket creation.
        let socket = Socket::new(domain, Type::STREAM.nonblocking(), Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(&listen_addr.into())?;

        let dispatcher = Dispatcher::new(Arc::downgrade(event_loop), socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            socket,
            dispatcher,
            listening: AtomicBool::new(false),
            on_new_connection: Mutex::new(None),
        });

        let weak: Weak<Acceptor> = Arc::downgrade(&acceptor);
        acceptor.dispatcher.set_read_callback(Arc::new(move |_at| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));

        Ok(acceptor)
    }

    /// The bound address; resolves the port when constructed with `:0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr().map(|addr| {
            addr.as_socket()
                .expect("listening socket has a non-IP address")
        })
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.on_new_connection.lock() = Some(cb);
    }

    /// Arm the listening socket and register read interest. Must run on the
    /// base loop's thread; a listen failure at this point is fatal because
    /// there is no caller left to hand the error to.
    pub fn listen(&self) {
        if let Err(e) = self.socket.listen(libc::SOMAXCONN) {
            error!(%e, "listen failed");
            panic!("listen failed: {e}");
        }
        self.listening.store(true, Ordering::Release);
        self.dispatcher.enable_read();
        match self.local_addr() {
            Ok(addr) => info!(%addr, "listening"),
            Err(_) => info!("listening"),
        }
    }

    // Drains the whole backlog: the default demultiplexer reports edges, so
    // anything left unaccepted would wait for the next incoming connection.
    fn handle_read(&self) {
        loop {
            match self.socket.accept() {
                Ok((socket, addr)) => {
                    let Some(peer) = addr.as_socket() else {
                        warn!("accepted connection without an IP peer address, dropped");
                        continue;
                    };
                    if let Err(e) = socket.set_nonblocking(true) {
                        error!(%e, %peer, "could not make accepted socket nonblocking");
                        continue;
                    }
                    CONNECTIONS_ACCEPTED.increment();
                    let callback = self.on_new_connection.lock();
                    match callback.as_ref() {
                        Some(cb) => cb(socket, peer),
                        // Nobody to hand the connection to; closing is the
                        // only sane answer.
                        None => drop(socket),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(%e, "accept failed");
                    if e.raw_os_error() == Some(libc::EMFILE)
                        || e.raw_os_error() == Some(libc::ENFILE)
                    {
                        error!("file descriptors exhausted, connection backlog will linger");
                    }
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Deregistration has to happen on the loop thread. When dropped
        // elsewhere, hand the dispatcher over; a stopped loop never runs the
        // task, which leaves nothing dangling since the demux dies with it.
        if self.event_loop.is_in_loop_thread() {
            self.dispatcher.disable_all();
            self.dispatcher.remove();
        } else {
            let dispatcher = self.dispatcher.clone();
            self.event_loop.run_on_loop(move || {
                dispatcher.disable_all();
                dispatcher.remove();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_and_reports_an_ephemeral_port() {
        let event_loop = EventLoop::new().unwrap();
        let acceptor =
            Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = acceptor.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
        assert!(!acceptor.listening());
    }

    #[test]
    fn reuse_port_allows_two_binds() {
        let event_loop = EventLoop::new().unwrap();
        let first = Acceptor::new(&event_loop, "127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();
        let second = Acceptor::new(&event_loop, addr, true);
        assert!(second.is_ok());
    }
}
