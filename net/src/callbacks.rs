//! Callback type aliases shared across the server, connection, and pool.
//!
//! All user-facing hooks are shared closures so one registration on the
//! server can be handed to every accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;
use crate::timestamp::Timestamp;

/// Deferred unit of work submitted to an event loop.
pub type Task = Box<dyn FnOnce() + Send>;

/// Fired when a connection becomes established and again when it goes down;
/// distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired from the owning loop whenever bytes arrive; the buffer holds all
/// unconsumed input.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Timestamp) + Send + Sync>;

/// Fired once the output buffer has fully drained to the socket.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fired when a send pushes the pending output across the high-water mark;
/// the second argument is the pending byte count at the crossing.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Fired once on each worker loop (or the base loop with zero workers)
/// before it starts handling connections.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Internal: server-facing removal hook installed on every connection.
pub(crate) type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Internal: acceptor-to-server handoff of a freshly accepted socket.
pub(crate) type NewConnectionCallback = Box<dyn Fn(socket2::Socket, SocketAddr) + Send>;
