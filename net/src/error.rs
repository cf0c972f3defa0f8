use std::io;

/// Errors surfaced while bringing the framework up.
///
/// Steady-state I/O never reports through this type: per-connection errors
/// are routed through the connection close path and the user's connection
/// callback instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or notification-descriptor syscall failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Readiness demultiplexer could not be created.
    #[error("demultiplexer setup: {0}")]
    Setup(String),

    /// A worker loop thread failed to come up.
    #[error("loop thread startup: {0}")]
    ThreadStart(String),
}
