//! TLS transport implementation using `tokio-rustls`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

use crate::{PeerVerification, SecureTransport, TransportError};

/// File name of the PEM certificate chain inside a credentials directory.
pub const CERTIFICATE_FILE: &str = "certificate.pem";
/// File name of the PEM private key inside a credentials directory.
pub const PRIVATE_KEY_FILE: &str = "private_key.pem";

/// A [`SecureTransport`] that terminates TLS on accepted TCP sockets.
///
/// Cloning is cheap; clones share one rustls `ServerConfig`.
#[derive(Clone)]
pub struct TlsTransport {
    acceptor: TlsAcceptor,
}

impl TlsTransport {
    /// Loads `certificate.pem` and `private_key.pem` from `dir`.
    pub fn from_dir(dir: &Path, verification: &PeerVerification) -> Result<Self, TransportError> {
        Self::from_pem_files(
            &dir.join(CERTIFICATE_FILE),
            &dir.join(PRIVATE_KEY_FILE),
            verification,
        )
    }

    /// Loads a PEM certificate chain and a PEM private key.
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        verification: &PeerVerification,
    ) -> Result<Self, TransportError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let builder = match verification {
            PeerVerification::None => builder.with_no_client_auth(),
            PeerVerification::Required { ca_file } => {
                builder.with_client_cert_verifier(client_verifier(ca_file, provider)?)
            }
        };
        let config = builder.with_single_cert(certs, key)?;

        tracing::info!(
            cert = %cert_path.display(),
            client_auth = matches!(verification, PeerVerification::Required { .. }),
            "TLS credentials loaded"
        );
        Ok(Self::from_server_config(Arc::new(config)))
    }

    /// Wraps an already-built rustls configuration.
    pub fn from_server_config(config: Arc<ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl SecureTransport for TlsTransport {
    type Raw = TcpStream;
    type Stream = TlsStream<TcpStream>;

    async fn handshake(&self, raw: TcpStream) -> Result<Self::Stream, TransportError> {
        self.acceptor
            .accept(raw)
            .await
            .map_err(TransportError::Handshake)
    }
}

fn client_verifier(
    ca_file: &Path,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn rustls::server::danger::ClientCertVerifier>, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots.add(cert)?;
    }
    Ok(WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?)
}

fn open(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TransportError::Credentials {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TransportError::Credentials {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TransportError::Credentials {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TransportError::NoPrivateKey(path.to_path_buf()))
}
