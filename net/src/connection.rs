use std::any::Any;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::dispatch::Dispatcher;
use crate::event_loop::EventLoop;
use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, CONNECTIONS_ACTIVE};
use crate::timestamp::Timestamp;

/// Pending-output threshold before the backpressure callback fires.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle. Transitions only move forward:
/// `Connecting → Connected → Disconnecting → Disconnected`, with the
/// `Disconnecting` stop skipped when the peer closes or errors first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

fn conn_state(raw: u8) -> ConnState {
    match raw {
        0 => ConnState::Connecting,
        1 => ConnState::Connected,
        2 => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

/// One accepted socket: its dispatcher, input/output buffers, and state
/// machine, pinned to one worker loop.
///
/// Handles are shared (`Arc`); `send` and `shutdown` may be called from any
/// thread and marshal themselves onto the owning loop. Everything else —
/// buffer mutation, interest changes, state transitions — happens on that
/// loop's thread only. The state read by [`connected`](Self::connected) is
/// advisory off-thread: a racing close can flip it right after the read,
/// which is why `send` re-checks on the loop.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    dispatcher: Arc<Dispatcher>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_high_water_mark: Mutex<Option<HighWaterMarkCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Wrap an accepted, nonblocking socket. The connection starts in
    /// `Connecting`; nothing is registered with the demultiplexer until
    /// [`connect_established`](Self::connect_established) runs on the
    /// owning loop.
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keepalive(true) {
            warn!(name = %name, %e, "could not enable keepalive");
        }
        let dispatcher = Dispatcher::new(Arc::downgrade(&event_loop), socket.as_raw_fd());
        debug!(name = %name, fd = socket.as_raw_fd(), "connection created");

        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            dispatcher,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            on_connection: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            on_high_water_mark: Mutex::new(None),
            on_close: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        conn.dispatcher.set_read_callback(Arc::new({
            let weak = weak.clone();
            move |at| {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read(at);
                }
            }
        }));
        conn.dispatcher.set_write_callback(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        conn.dispatcher.set_close_callback(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        conn.dispatcher.set_error_callback(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));

        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn state(&self) -> ConnState {
        conn_state(self.state.load(Ordering::Acquire))
    }

    /// Advisory: a close on the owning loop can race this read.
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.on_connection.lock() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.on_message.lock() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.on_write_complete.lock() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        *self.on_high_water_mark.lock() = Some(cb);
    }

    /// Pending-output threshold for the backpressure callback; a soft
    /// signal, the buffer keeps growing past it.
    pub fn set_high_water_mark(&self, bytes: usize) {
        self.high_water_mark.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.on_close.lock() = Some(cb);
    }

    /// Queue `data` for delivery. Callable from any thread; off-thread
    /// callers pay one copy and a trip through the loop's task queue. On a
    /// connection that is not established the data is dropped with a
    /// warning.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnState::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let conn = self.clone();
                let data = data.to_vec();
                self.event_loop.run_on_loop(move || conn.send_in_loop(&data));
            }
        } else {
            warn!(name = %self.name, bytes = data.len(), "send on a connection that is not established, dropped");
        }
    }

    /// The write path proper. Tries one direct write when nothing is queued,
    /// buffers the remainder, fires the high-water callback on an upward
    /// crossing, and arms write interest so the drain path takes over.
    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        let mut sent = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // send() checked state on the caller's thread; re-check here because
        // a close may have won the race to the loop.
        if self.state() == ConnState::Disconnected {
            warn!(name = %self.name, "connection went down before the write, giving up");
            return;
        }

        if !self.dispatcher.is_writing() && self.output.lock().readable_bytes() == 0 {
            match self.socket.send(data) {
                Ok(n) => {
                    sent = n;
                    remaining = data.len() - n;
                    BYTES_SENT.add(n as u64);
                    if remaining == 0 {
                        if let Some(cb) = self.on_write_complete.lock().clone() {
                            let conn = self.clone();
                            self.event_loop.enqueue(move || cb(&conn));
                        }
                    }
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(name = %self.name, %e, "direct write failed");
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output.lock();
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.on_high_water_mark.lock().clone() {
                    let conn = self.clone();
                    let pending = old_len + remaining;
                    self.event_loop.enqueue(move || cb(&conn, pending));
                }
            }
            output.append(&data[sent..]);
            drop(output);
            if !self.dispatcher.is_writing() {
                self.dispatcher.enable_write();
            }
        }
    }

    /// Half-close: stop sending once the pending output drains, keep
    /// reading until the peer's EOF. Only meaningful from `Connected`.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.event_loop.run_on_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        // Write interest still armed means the output buffer has not
        // drained; the drain path finishes the half-close.
        if !self.dispatcher.is_writing() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                error!(name = %self.name, %e, "shutdown(write) failed");
            }
        }
    }

    /// Server-side: runs once on the owning loop right after the connection
    /// is handed to it. Ties the dispatcher to this connection, arms read
    /// interest, and announces the connection to the user.
    pub fn connect_established(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        self.dispatcher
            .tie(self.clone() as Arc<dyn Any + Send + Sync>);
        self.dispatcher.enable_read();
        CONNECTIONS_ACTIVE.increment();
        debug!(name = %self.name, peer = %self.peer_addr, "connection established");

        if let Some(cb) = self.on_connection.lock().clone() {
            cb(self);
        }
    }

    /// Server-side: the last call a connection ever sees, on its owning
    /// loop. Covers both orderly teardown after a close and the server
    /// destructor sweeping still-open connections.
    pub fn connect_destroyed(self: &Arc<Self>) {
        assert!(self.event_loop.is_in_loop_thread());
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.dispatcher.disable_all();
            CONNECTIONS_ACTIVE.decrement();
            if let Some(cb) = self.on_connection.lock().clone() {
                cb(self);
            }
        }
        self.dispatcher.remove();
        debug!(name = %self.name, "connection destroyed");
    }

    // Reads until the socket runs dry: the default demultiplexer reports
    // edges, so bytes left in the kernel buffer would not be re-announced.
    // The message callback fires once with everything this cycle brought.
    fn handle_read(self: &Arc<Self>, at: Timestamp) {
        let mut input = self.input.lock();
        let mut received = 0usize;
        let mut saw_eof = false;
        let mut failure: Option<io::Error> = None;

        loop {
            match input.read_fd(self.socket.as_raw_fd()) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if received > 0 {
            BYTES_RECEIVED.add(received as u64);
            if let Some(cb) = self.on_message.lock().clone() {
                cb(self, &mut input, at);
            }
        }
        drop(input);

        if saw_eof {
            self.handle_close();
        } else if let Some(e) = failure {
            // A reset consumes its one edge; without closing here the
            // connection would linger with no further events to drive it.
            error!(name = %self.name, %e, "read failed");
            self.handle_error();
            self.handle_close();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.dispatcher.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }
        let mut output = self.output.lock();
        match output.write_fd(self.socket.as_raw_fd()) {
            Ok(n) if n > 0 => {
                BYTES_SENT.add(n as u64);
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.dispatcher.disable_write();
                    if let Some(cb) = self.on_write_complete.lock().clone() {
                        let conn = self.clone();
                        self.event_loop.enqueue(move || cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(name = %self.name, %e, "drain write failed");
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        let state = self.state();
        if state != ConnState::Connected && state != ConnState::Disconnecting {
            return;
        }
        debug!(name = %self.name, ?state, "connection closing");
        self.set_state(ConnState::Disconnected);
        self.dispatcher.disable_all();
        CONNECTIONS_ACTIVE.decrement();

        if let Some(cb) = self.on_connection.lock().clone() {
            cb(self);
        }
        // Hands the connection back to the server for removal and final
        // destruction on this loop.
        if let Some(cb) = self.on_close.lock().clone() {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!(name = %self.name, %e, "socket error"),
            Ok(None) => error!(name = %self.name, "error event with no pending socket error"),
            Err(e) => error!(name = %self.name, %e, "could not fetch socket error"),
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        trace!(name = %self.name, state = ?self.state(), "connection dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn tcp_pair() -> (Socket, TcpStream, SocketAddr, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let local = server.local_addr().unwrap();
        let socket = Socket::from(server);
        socket.set_nonblocking(true).unwrap();
        (socket, client, local, peer)
    }

    #[test]
    fn send_before_established_is_dropped() {
        let event_loop = EventLoop::new().unwrap();
        let (socket, _client, local, peer) = tcp_pair();
        let conn = TcpConnection::new(event_loop, "t#1".to_string(), socket, local, peer);

        assert_eq!(conn.state(), ConnState::Connecting);
        conn.send(b"too early");
        assert_eq!(conn.output.lock().readable_bytes(), 0);
    }

    #[test]
    fn established_and_destroyed_signal_the_user_once_each() {
        let event_loop = EventLoop::new().unwrap();
        let (socket, _client, local, peer) = tcp_pair();
        let conn = TcpConnection::new(event_loop, "t#1".to_string(), socket, local, peer);

        let seen = Arc::new(Mutex::new(Vec::new()));
        conn.set_connection_callback(Arc::new({
            let seen = seen.clone();
            move |conn: &Arc<TcpConnection>| seen.lock().push(conn.connected())
        }));

        // The owning loop is this thread, so these run synchronously.
        conn.connect_established();
        assert!(conn.connected());
        conn.connect_destroyed();
        assert!(!conn.connected());
        // Up exactly once, then down exactly once.
        assert_eq!(*seen.lock(), vec![true, false]);

        // A second teardown must not re-signal.
        conn.connect_destroyed();
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[test]
    fn in_loop_send_writes_through_to_the_peer() {
        use std::io::Read;

        let event_loop = EventLoop::new().unwrap();
        let (socket, mut client, local, peer) = tcp_pair();
        let conn = TcpConnection::new(event_loop, "t#1".to_string(), socket, local, peer);
        conn.connect_established();

        conn.send(b"payload");
        let mut out = [0u8; 7];
        client.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"payload");

        conn.connect_destroyed();
    }
}
