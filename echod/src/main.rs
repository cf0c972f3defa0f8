//! Echo server demo: every byte a client sends comes straight back.
//!
//! ```text
//! echod --listen 127.0.0.1:7878 --threads 4
//! ```

use std::net::SocketAddr;

use clap::Parser;
use riptide::{EventLoop, TcpServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "echod", about = "riptide echo server")]
struct Options {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:7878")]
    listen: SocketAddr,

    /// Worker event loops; 0 runs everything on the main thread.
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Share the port across processes (SO_REUSEPORT).
    #[arg(long)]
    reuse_port: bool,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let options = Options::parse();

    // RUST_LOG wins over the CLI flag.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(&options.log)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();

    let base_loop = EventLoop::new().expect("event loop setup");
    let server = TcpServer::new(&base_loop, options.listen, "echod", options.reuse_port)
        .expect("server setup");
    server.set_thread_num(options.threads);

    server.set_connection_callback(|conn| {
        if conn.connected() {
            info!(name = conn.name(), peer = %conn.peer_addr(), "up");
        } else {
            info!(name = conn.name(), "down");
        }
    });
    server.set_message_callback(|conn, buf, _at| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });

    server.start().expect("server start");
    info!(addr = %server.listen_addr().expect("listen addr"), threads = options.threads, "echod running");
    base_loop.run();
}
