use std::path::PathBuf;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A credential file could not be opened or parsed.
    #[error("failed to read {}: {source}", .path.display())]
    Credentials {
        /// The offending file.
        path: PathBuf,
        /// The underlying I/O or PEM error.
        #[source]
        source: std::io::Error,
    },

    /// The certificate file holds no certificate.
    #[error("no certificate found in {}", .0.display())]
    NoCertificates(PathBuf),

    /// The key file holds no private key.
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    /// rustls rejected the certificate, key or trust anchors.
    #[cfg(feature = "tls")]
    #[error("tls configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    /// The client-certificate verifier could not be built.
    #[cfg(feature = "tls")]
    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    /// The handshake with the peer failed.
    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}
