//! # Moat
//!
//! A multi-threaded, TLS-terminating TCP server.
//!
//! Moat accepts TCP connections on one port, runs a TLS handshake on each,
//! and then echoes back what the client sends. Every connection is an
//! independent task on a fixed pool of worker threads. When the number of
//! live connections reaches a ceiling, accepting pauses for a cooldown
//! period. The port stays bound and new clients wait in the backlog.
//!
//! ```text
//! ReactorPool (N workers, one I/O driver)
//!   └─ accept loop ── AdmissionController (Listening ⇄ Cooldown)
//!        └─ Session per socket: handshake → read ⇄ process → write → close
//!             ├─ ClientRegistry   (unique connection ids)
//!             ├─ LiveConnections  (handshaken, not yet closed)
//!             └─ EchoPolicy       (immediate or accumulate)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use moat::prelude::*;
//!
//! let mut server = Server::builder()
//!     .port(8443)
//!     .credentials_dir("certs")
//!     .build();
//! server.start()?;
//! // ... wait for a shutdown signal ...
//! server.shutdown()?;
//! # Ok::<(), ServerError>(())
//! ```

mod config;
mod error;
mod pool;
mod server;
mod session;

pub use config::{MIN_WORKER_THREADS, ServerConfig};
pub use error::ServerError;
pub use pool::ReactorPool;
pub use server::{Server, ServerBuilder};
pub use session::SessionOutcome;

pub use moat_admission::AdmissionState;
pub use moat_protocol::EchoPolicyKind;
pub use moat_transport::{PeerVerification, SecureTransport, TlsTransport, TransportError};

/// Convenience re-exports for building and running a server.
pub mod prelude {
    pub use crate::{
        AdmissionState, EchoPolicyKind, PeerVerification, Server, ServerBuilder, ServerConfig,
        ServerError,
    };
}
