//! Top-level error type for the Moat server.

use std::io;
use std::net::SocketAddr;

use moat_transport::TransportError;

/// Errors returned by [`Server`](crate::Server) and
/// [`ReactorPool`](crate::ReactorPool).
///
/// Per-connection failures never show up here: they end the connection's
/// session and are logged. What does surface is anything that stops the
/// server from starting or keeps the accept loop from running.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// TLS credentials could not be loaded.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The worker pool could not be built.
    #[error("failed to start worker pool: {0}")]
    Runtime(#[source] io::Error),

    /// The operation needs a running server or pool.
    #[error("not running")]
    NotRunning,

    /// The accept loop task panicked or was cancelled.
    #[error("accept loop task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
