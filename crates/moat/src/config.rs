//! Server configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use moat_admission::AdmissionConfig;
use moat_protocol::EchoPolicyKind;
use moat_transport::PeerVerification;
use serde::Deserialize;

/// Fewest worker threads the reactor pool will run with.
pub const MIN_WORKER_THREADS: usize = 2;

/// Everything the server needs to start.
///
/// Every field has a default, so a configuration file only lists what it
/// changes. Durations are given in (fractional) seconds:
///
/// ```toml
/// port = 8443
/// worker_threads = 4
/// max_connections = 512
/// cooldown_secs = 2.5
/// credentials_dir = "/etc/moat"
/// echo_policy = "accumulate"
/// accumulate_limit = 1048576
/// idle_timeout_secs = 30
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker threads in the reactor pool. Raised to
    /// [`MIN_WORKER_THREADS`] if lower.
    pub worker_threads: usize,
    /// Listen port on all local addresses. `0` lets the OS pick one.
    pub port: u16,
    /// Live connections at which accepting pauses.
    pub max_connections: usize,
    /// How long accepting stays paused after the ceiling is reached.
    #[serde(rename = "cooldown_secs", with = "secs")]
    pub cooldown: Duration,
    /// Directory holding `certificate.pem` and `private_key.pem`.
    pub credentials_dir: PathBuf,
    /// Client certificate requirements.
    pub peer_verification: PeerVerification,
    /// How received bytes are echoed back.
    pub echo_policy: EchoPolicyKind,
    /// Byte limit for the accumulate policy. Unbounded when unset.
    pub accumulate_limit: Option<usize>,
    /// Close connections that send nothing for this long, including
    /// peers that never finish their handshake. Off when unset.
    #[serde(rename = "idle_timeout_secs", with = "opt_secs")]
    pub idle_timeout: Option<Duration>,
    /// Listen backlog.
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let admission = AdmissionConfig::default();
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_WORKER_THREADS),
            port: 8443,
            max_connections: admission.max_connections,
            cooldown: admission.cooldown,
            credentials_dir: PathBuf::from("certs"),
            peer_verification: PeerVerification::None,
            echo_policy: EchoPolicyKind::Immediate,
            accumulate_limit: None,
            idle_timeout: None,
            backlog: 1024,
        }
    }
}

impl ServerConfig {
    /// Clamps out-of-range values, logging each adjustment.
    pub fn validated(mut self) -> Self {
        if self.worker_threads < MIN_WORKER_THREADS {
            tracing::warn!(
                requested = self.worker_threads,
                using = MIN_WORKER_THREADS,
                "worker_threads below minimum"
            );
            self.worker_threads = MIN_WORKER_THREADS;
        }
        if self.backlog == 0 {
            tracing::warn!("backlog of 0 requested, using 1");
            self.backlog = 1;
        }
        let admission = self.admission().validated();
        self.max_connections = admission.max_connections;
        self
    }

    /// The address the listener binds: every local IPv4 address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub(crate) fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_connections: self.max_connections,
            cooldown: self.cooldown,
        }
    }
}

// ---------------------------------------------------------------------------
// Duration fields as seconds
// ---------------------------------------------------------------------------

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(de)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
            .transpose()
    }
}
