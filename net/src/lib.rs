//! Multi-reactor TCP server framework.
//!
//! One [`EventLoop`] runs per thread. A [`TcpServer`] owns an acceptor on the
//! base loop and a pool of worker loops; each accepted connection is pinned
//! to one worker loop for its whole life, so per-connection state is mutated
//! from exactly one thread and user callbacks never race each other.
//!
//! ```no_run
//! use riptide::{EventLoop, TcpServer};
//!
//! let base = EventLoop::new().unwrap();
//! let server = TcpServer::new(&base, "127.0.0.1:7878".parse().unwrap(), "echo", false).unwrap();
//! server.set_thread_num(4);
//! server.set_message_callback(|conn, buf, _at| {
//!     let data = buf.retrieve_all_as_bytes();
//!     conn.send(&data);
//! });
//! server.start().unwrap();
//! base.run();
//! ```

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod connection;
pub mod demux;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod timestamp;

pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback,
    WriteCompleteCallback,
};
pub use connection::{ConnState, TcpConnection};
pub use dispatch::{Dispatcher, Interest, Ready};
pub use error::Error;
pub use event_loop::EventLoop;
pub use pool::LoopPool;
pub use server::TcpServer;
pub use timestamp::Timestamp;
