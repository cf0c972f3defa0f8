use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use socket2::Socket;
use tracing::{error, info};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::callbacks::{
    ConnectionCallback, MessageCallback, ThreadInitCallback, WriteCompleteCallback,
};
use crate::connection::TcpConnection;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::pool::LoopPool;
use crate::timestamp::Timestamp;

/// The public entry point: composes the acceptor (on the base loop), the
/// worker-loop pool, and the live-connection map.
///
/// Connections are minted on the base loop's thread when the acceptor fires,
/// assigned a worker round-robin, and live on that worker until teardown
/// routes back through the base loop to drop them from the map.
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    base_loop: Arc<EventLoop>,
    name: String,
    ip_port: String,
    acceptor: Arc<Acceptor>,
    pool: LoopPool,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_thread_init: Mutex<Option<ThreadInitCallback>>,
    // Touched only from the base loop's thread in steady state; the mutex
    // is for the destructor, which may run elsewhere.
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
}

impl TcpServer {
    /// Create a server bound to `listen_addr` (not yet listening — that
    /// happens at [`start`](Self::start)). `name` prefixes connection names
    /// and worker-thread names.
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<TcpServer, Error> {
        let acceptor = Acceptor::new(base_loop, listen_addr, reuse_port)?;
        let ip_port = acceptor.local_addr()?.to_string();

        let inner = Arc::new(ServerInner {
            base_loop: base_loop.clone(),
            name: name.to_string(),
            ip_port,
            acceptor,
            pool: LoopPool::new(base_loop.clone(), name),
            on_connection: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            on_thread_init: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        });

        let weak: Weak<ServerInner> = Arc::downgrade(&inner);
        inner
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer| {
                if let Some(inner) = weak.upgrade() {
                    inner.new_connection(socket, peer);
                }
            }));

        Ok(TcpServer { inner })
    }

    /// Number of worker loops. Zero (the default) keeps everything —
    /// accepting and connection I/O — on the base loop.
    pub fn set_thread_num(&self, n: usize) {
        self.inner.pool.set_thread_num(n);
    }

    pub fn set_connection_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.inner.on_connection.lock() = Some(Arc::new(f));
    }

    pub fn set_message_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        *self.inner.on_message.lock() = Some(Arc::new(f));
    }

    pub fn set_write_complete_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        *self.inner.on_write_complete.lock() = Some(Arc::new(f));
    }

    pub fn set_thread_init_callback<F>(&self, f: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        *self.inner.on_thread_init.lock() = Some(Arc::new(f));
    }

    /// Start the worker pool and arm the listener. Idempotent: later calls
    /// are no-ops.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.inner.name, addr = %self.inner.ip_port, "server starting");
        self.inner.pool.start(self.inner.on_thread_init.lock().clone())?;
        let acceptor = self.inner.acceptor.clone();
        self.inner.base_loop.run_on_loop(move || acceptor.listen());
        Ok(())
    }

    /// The bound listening address (port resolved for `:0` binds).
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let conns: Vec<_> = {
            let mut map = self.inner.connections.lock();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            let io_loop = conn.owner_loop().clone();
            io_loop.run_on_loop(move || conn.connect_destroyed());
        }
        // The pool (and with it every worker loop) stops when `inner` drops.
    }
}

impl ServerInner {
    /// Acceptor handoff; base-loop thread.
    fn new_connection(self: Arc<Self>, socket: Socket, peer: SocketAddr) {
        debug_assert!(self.base_loop.is_in_loop_thread());

        let io_loop = self.pool.next();
        let id = self.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(name = %conn_name, %peer, "new connection");

        let local = match socket.local_addr().map(|a| a.as_socket()) {
            Ok(Some(addr)) => addr,
            _ => {
                error!(name = %conn_name, "getsockname failed on accepted socket");
                SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local, peer);

        if let Some(cb) = self.on_connection.lock().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.on_message.lock().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.on_write_complete.lock().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = Arc::downgrade(&self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_connection(conn);
            }
        }));

        self.connections.lock().insert(conn_name, conn.clone());
        io_loop.run_on_loop(move || conn.connect_established());
    }

    /// Entered from a connection's worker loop; marshals to the base loop,
    /// which owns the map.
    fn remove_connection(self: Arc<Self>, conn: &Arc<TcpConnection>) {
        let conn = conn.clone();
        let inner = self.clone();
        self.base_loop
            .run_on_loop(move || inner.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        info!(name = %conn.name(), "removing connection");
        self.connections.lock().remove(conn.name());
        let io_loop = conn.owner_loop().clone();
        let conn = conn.clone();
        io_loop.enqueue(move || conn.connect_destroyed());
    }
}
