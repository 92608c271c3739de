//! Transport abstraction layer for Moat.
//!
//! The server core never touches cryptography. It hands every accepted
//! socket to a [`SecureTransport`], which performs the handshake and gives
//! back an encrypted byte stream. Everything after that is ordinary tokio
//! `AsyncRead` / `AsyncWrite`.
//!
//! # Feature Flags
//!
//! - `tls` (default): [`TlsTransport`], backed by `rustls` via `tokio-rustls`

mod error;
#[cfg(feature = "tls")]
mod tls;

pub use error::TransportError;
#[cfg(feature = "tls")]
pub use tls::{CERTIFICATE_FILE, PRIVATE_KEY_FILE, TlsTransport};

use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

/// Performs the server side of a secure handshake on accepted sockets.
///
/// # Trait bounds
///
/// - `Send + Sync + 'static` → one transport is shared by every connection
///   task for the lifetime of the server.
/// - The handshake future is `Send` because connection tasks move between
///   worker threads.
pub trait SecureTransport: Send + Sync + 'static {
    /// The raw, unencrypted socket the handshake runs over.
    type Raw: Send + 'static;
    /// The encrypted stream produced by a successful handshake.
    ///
    /// Dropping it closes the underlying socket.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Runs the server side of the handshake.
    ///
    /// The raw socket is consumed either way; on failure it is dropped
    /// (and therefore closed) before this returns.
    fn handshake(
        &self,
        raw: Self::Raw,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

/// Whether clients must present a certificate.
///
/// In configuration files this is a table tagged by `mode`:
///
/// ```toml
/// [peer_verification]
/// mode = "required"
/// ca_file = "/etc/moat/clients.pem"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PeerVerification {
    /// Any client may connect; no client certificate is requested.
    #[default]
    None,
    /// Clients must present a certificate chaining to one in `ca_file`.
    Required {
        /// PEM bundle of trusted client CAs.
        ca_file: PathBuf,
    },
}
