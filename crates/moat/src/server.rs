//! `Server` builder, lifecycle and accept loop.
//!
//! This is the entry point for running a Moat server. It ties together
//! the layers: reactor pool → listener + admission → sessions.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use moat_admission::{Admission, AdmissionController, AdmissionState, LiveConnections};
use moat_protocol::EchoPolicyKind;
use moat_registry::{ClientRegistry, ConnectionId};
use moat_transport::{PeerVerification, SecureTransport, TlsTransport, TransportError};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::pool::ReactorPool;
use crate::session::{Session, SessionContext, SessionGuard, SessionOutcome};
use crate::ServerError;

/// Pause after a failed `accept()` so a persistent error (such as running
/// out of file descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type TransportFactory<T> =
    Box<dyn Fn(&ServerConfig) -> Result<Arc<T>, TransportError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for configuring a [`Server`].
///
/// # Example
///
/// ```rust,no_run
/// use moat::prelude::*;
///
/// let mut server = Server::builder()
///     .port(8443)
///     .worker_threads(4)
///     .max_connections(512)
///     .credentials_dir("/etc/moat")
///     .build();
/// server.start()?;
/// // ...
/// server.shutdown()?;
/// # Ok::<(), ServerError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the listen port. `0` lets the OS pick one.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the number of worker threads.
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Sets the live-connection ceiling.
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    /// Sets how long accepting pauses after the ceiling is hit.
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.config.cooldown = cooldown;
        self
    }

    /// Sets the directory holding `certificate.pem` and `private_key.pem`.
    pub fn credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.credentials_dir = dir.into();
        self
    }

    /// Sets the client certificate requirements.
    pub fn peer_verification(mut self, verification: PeerVerification) -> Self {
        self.config.peer_verification = verification;
        self
    }

    /// Sets the echo policy.
    pub fn echo_policy(mut self, policy: EchoPolicyKind) -> Self {
        self.config.echo_policy = policy;
        self
    }

    /// Caps how many bytes the accumulate policy buffers per connection.
    pub fn accumulate_limit(mut self, limit: usize) -> Self {
        self.config.accumulate_limit = Some(limit);
        self
    }

    /// Closes connections that stay silent for `timeout`, handshake included.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Sets the listen backlog.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    /// Builds a TLS server. Credentials are loaded by [`Server::start`].
    pub fn build(self) -> Server {
        Server::new(self.config)
    }

    /// Builds a server that secures connections with `transport`.
    pub fn build_with_transport<T>(self, transport: T) -> Server<T>
    where
        T: SecureTransport<Raw = TcpStream>,
    {
        Server::with_transport(self.config, transport)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// A TLS echo server running on its own [`ReactorPool`].
///
/// The server owns its runtime, so it is driven from ordinary
/// (non-async) code: [`start`](Self::start) returns once the listener is
/// bound, and [`shutdown`](Self::shutdown) blocks until the workers have
/// stopped. Dropping a running server shuts it down.
pub struct Server<T: SecureTransport<Raw = TcpStream> = TlsTransport> {
    config: ServerConfig,
    pool: ReactorPool,
    registry: Arc<ClientRegistry>,
    admission: Arc<AdmissionController>,
    make_transport: TransportFactory<T>,
    running: Option<Running>,
}

/// Handles to a started accept loop.
struct Running {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<Result<(), ServerError>>,
}

impl Server {
    /// Creates a new builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Creates a TLS server from `config`.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_factory(
            config,
            Box::new(|config: &ServerConfig| {
                TlsTransport::from_dir(&config.credentials_dir, &config.peer_verification)
                    .map(Arc::new)
            }),
        )
    }
}

impl<T: SecureTransport<Raw = TcpStream>> Server<T> {
    /// Creates a server that secures connections with `transport`.
    pub fn with_transport(config: ServerConfig, transport: T) -> Self {
        let transport = Arc::new(transport);
        Self::with_factory(
            config,
            Box::new(move |_: &ServerConfig| -> Result<Arc<T>, TransportError> {
                Ok(Arc::clone(&transport))
            }),
        )
    }

    fn with_factory(config: ServerConfig, make_transport: TransportFactory<T>) -> Self {
        let config = config.validated();
        let admission = AdmissionController::new(config.admission(), LiveConnections::new());
        Self {
            pool: ReactorPool::new(config.worker_threads),
            registry: Arc::new(ClientRegistry::new()),
            admission: Arc::new(admission),
            make_transport,
            running: None,
            config,
        }
    }

    /// Starts the pool, binds the listener and begins accepting.
    ///
    /// Does nothing if the server is already running.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.running.is_some() {
            tracing::debug!("start called on a running server");
            return Ok(());
        }

        let transport = (self.make_transport)(&self.config)?;
        self.pool.start()?;
        match self.launch(transport) {
            Ok(running) => {
                tracing::info!(
                    addr = %running.local_addr,
                    workers = self.pool.worker_threads(),
                    max_connections = self.admission.config().max_connections,
                    policy = ?self.config.echo_policy,
                    "server listening"
                );
                self.running = Some(running);
                Ok(())
            }
            Err(e) => {
                self.pool.stop();
                Err(e)
            }
        }
    }

    fn launch(&self, transport: Arc<T>) -> Result<Running, ServerError> {
        let addr = self.config.listen_addr();
        let listener = {
            let _context = self.pool.handle()?.enter();
            bind_listener(addr, self.config.backlog)
        }
        .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        // A previous run may have stopped mid-cooldown.
        self.admission.resume();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_loop = AcceptLoop {
            local_addr,
            registry: Arc::clone(&self.registry),
            admission: Arc::clone(&self.admission),
            ctx: Arc::new(SessionContext {
                transport,
                live: self.admission.live().clone(),
                policy: self.config.echo_policy,
                accumulate_limit: self.config.accumulate_limit,
                idle_timeout: self.config.idle_timeout,
            }),
            shutdown: shutdown_rx,
        };
        let accept_task = self.pool.spawn(accept_loop.run(listener))?;

        Ok(Running {
            local_addr,
            shutdown_tx,
            accept_task,
        })
    }

    /// Stops accepting, closes every connection and joins the workers.
    ///
    /// Does nothing if the server is not running. Returns the error that
    /// ended the accept loop early, if one did.
    pub fn shutdown(&mut self) -> Result<(), ServerError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        tracing::info!(addr = %running.local_addr, "shutting down");
        // The accept loop may already have exited; then nobody is listening.
        let _ = running.shutdown_tx.send(true);

        let result = if Handle::try_current().is_ok() {
            running.accept_task.abort();
            Ok(())
        } else {
            self.pool
                .block_on(running.accept_task)
                .and_then(|joined| joined.map_err(ServerError::Task))
                .and_then(|accept_result| accept_result)
        };

        self.pool.stop();
        tracing::info!("shutdown complete");
        result
    }

    /// Whether the server has been started and not shut down.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// The bound listen address. Reports the OS-chosen port when
    /// configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Connections that finished their handshake and are still open.
    pub fn live_connections(&self) -> usize {
        self.admission.live().current()
    }

    /// Connections accepted and not yet closed, including those still in
    /// their handshake.
    pub fn active_ids(&self) -> usize {
        self.registry.len()
    }

    /// Whether the listener is open or cooling down.
    pub fn admission_state(&self) -> AdmissionState {
        self.admission.state()
    }

    /// The (validated) configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl<T: SecureTransport<Raw = TcpStream>> Drop for Server<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "accept loop ended with error");
        }
    }
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Everything the accept loop task owns.
struct AcceptLoop<T: SecureTransport> {
    local_addr: SocketAddr,
    registry: Arc<ClientRegistry>,
    admission: Arc<AdmissionController>,
    ctx: Arc<SessionContext<T>>,
    shutdown: watch::Receiver<bool>,
}

impl<T: SecureTransport<Raw = TcpStream>> AcceptLoop<T> {
    /// Accepts until shutdown, pausing around each cooldown.
    ///
    /// The listener stays bound the whole time. Clients that connect
    /// during a cooldown wait in its backlog and are accepted afterwards.
    ///
    /// At most one `accept()` is outstanding. A candidate id for the next
    /// connection is drawn on another task while that accept waits; it
    /// only enters the registry once a socket has been accepted.
    async fn run(mut self, listener: TcpListener) -> Result<(), ServerError> {
        let mut live_changes = self.admission.live().subscribe();
        let mut next_id: Option<JoinHandle<ConnectionId>> = None;

        loop {
            if let Admission::CoolDown(wait) = self.admission.check() {
                tracing::debug!(addr = %self.local_addr, ?wait, "accept paused");
                tokio::select! {
                    _ = self.shutdown.changed() => return Ok(()),
                    () = tokio::time::sleep(wait) => {}
                }
                self.admission.resume();
                live_changes.borrow_and_update();
                continue;
            }

            let candidate = next_id.take().unwrap_or_else(|| self.draw_candidate());
            let accepted = tokio::select! {
                _ = self.shutdown.changed() => return Ok(()),
                // The live count moved while waiting: admission may have
                // changed, so re-check before accepting anything else.
                _ = live_changes.changed() => {
                    next_id = Some(candidate);
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            if self.admit(candidate, accepted).await?.is_none() {
                tokio::select! {
                    _ = self.shutdown.changed() => return Ok(()),
                    () = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

impl<T: SecureTransport> AcceptLoop<T> {
    fn draw_candidate(&self) -> JoinHandle<ConnectionId> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move { registry.candidate() })
    }

    /// Claims an id for an accepted socket and spawns its session.
    ///
    /// Nothing is registered for a failed accept; `None` is returned.
    async fn admit(
        &self,
        candidate: JoinHandle<ConnectionId>,
        accepted: io::Result<(T::Raw, SocketAddr)>,
    ) -> Result<Option<JoinHandle<SessionOutcome>>, ServerError> {
        match accepted {
            Ok((raw, peer)) => {
                let id = self.registry.claim(candidate.await?);
                let guard = SessionGuard::new(id, Arc::clone(&self.registry));
                let session = Session::new(guard, raw, Some(peer), Arc::clone(&self.ctx));
                Ok(Some(tokio::spawn(session.run())))
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                Ok(None)
            }
        }
    }
}

/// Binds a listener with `SO_REUSEADDR` so a restarted server can take the
/// port back while old connections sit in `TIME_WAIT`.
fn bind_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;

    struct Passthrough;

    impl SecureTransport for Passthrough {
        type Raw = DuplexStream;
        type Stream = DuplexStream;

        async fn handshake(&self, raw: DuplexStream) -> Result<DuplexStream, TransportError> {
            Ok(raw)
        }
    }

    fn accept_loop() -> AcceptLoop<Passthrough> {
        let live = LiveConnections::new();
        let (_tx, shutdown) = watch::channel(false);
        AcceptLoop {
            local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            registry: Arc::new(ClientRegistry::new()),
            admission: Arc::new(AdmissionController::new(
                Default::default(),
                live.clone(),
            )),
            ctx: Arc::new(SessionContext {
                transport: Arc::new(Passthrough),
                live,
                policy: EchoPolicyKind::Immediate,
                accumulate_limit: None,
                idle_timeout: None,
            }),
            shutdown,
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    // =====================================================================
    // admit()
    // =====================================================================

    #[tokio::test]
    async fn test_admit_accept_error_registers_nothing() {
        let accept_loop = accept_loop();
        let candidate = accept_loop.draw_candidate();

        let result = accept_loop
            .admit(
                candidate,
                Err(io::Error::new(io::ErrorKind::ConnectionAborted, "aborted")),
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(accept_loop.registry.is_empty());
        assert_eq!(accept_loop.ctx.live.current(), 0);
    }

    #[tokio::test]
    async fn test_admit_accepted_socket_runs_session() {
        let accept_loop = accept_loop();
        let (mut client, server) = tokio::io::duplex(64);
        let candidate = accept_loop.draw_candidate();

        let session = accept_loop
            .admit(candidate, Ok((server, peer())))
            .await
            .unwrap()
            .expect("session spawned");
        assert_eq!(accept_loop.registry.len(), 1);

        client.write_all(b"hi").await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(&reply, b"hi");
        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
        assert!(accept_loop.registry.is_empty());
    }

    #[tokio::test]
    async fn test_admit_taken_candidate_claims_other_id() {
        let accept_loop = accept_loop();
        let (client, server) = tokio::io::duplex(64);
        let id = accept_loop.registry.candidate();
        // Another connection claimed the same value first.
        accept_loop.registry.claim(id);
        let candidate = tokio::spawn(async move { id });

        let session = accept_loop
            .admit(candidate, Ok((server, peer())))
            .await
            .unwrap()
            .expect("session spawned");

        assert_eq!(accept_loop.registry.len(), 2);
        drop(client);
        session.await.unwrap();
        assert_eq!(accept_loop.registry.len(), 1);
        assert!(accept_loop.registry.is_active(id));
    }

    #[tokio::test]
    async fn test_admit_repeated_accept_errors_leak_nothing() {
        let accept_loop = accept_loop();

        for _ in 0..32 {
            let candidate = accept_loop.draw_candidate();
            let result = accept_loop
                .admit(
                    candidate,
                    Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
                )
                .await
                .unwrap();
            assert!(result.is_none());
        }

        assert!(accept_loop.registry.is_empty());
    }

    #[tokio::test]
    async fn test_draw_candidate_reserves_nothing() {
        let accept_loop = accept_loop();

        let candidate = accept_loop.draw_candidate().await.unwrap();

        assert!(!accept_loop.registry.is_active(candidate));
        assert!(accept_loop.registry.is_empty());
    }

    // =====================================================================
    // bind_listener()
    // =====================================================================

    #[tokio::test]
    async fn test_bind_listener_can_rebind_same_port() {
        let first = bind_listener(SocketAddr::from(([127, 0, 0, 1], 0)), 16).unwrap();
        let addr = first.local_addr().unwrap();
        drop(first);

        let second = bind_listener(addr, 16).unwrap();

        assert_eq!(second.local_addr().unwrap(), addr);
    }

    // =====================================================================
    // Builder
    // =====================================================================

    #[test]
    fn test_builder_applies_settings() {
        let server = Server::builder()
            .port(0)
            .worker_threads(3)
            .max_connections(10)
            .cooldown(Duration::from_millis(250))
            .echo_policy(EchoPolicyKind::Accumulate)
            .accumulate_limit(64)
            .idle_timeout(Duration::from_secs(9))
            .build();

        let config = server.config();
        assert_eq!(config.port, 0);
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.cooldown, Duration::from_millis(250));
        assert_eq!(config.echo_policy, EchoPolicyKind::Accumulate);
        assert_eq!(config.accumulate_limit, Some(64));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(9)));
        assert!(!server.is_running());
        assert_eq!(server.local_addr(), None);
    }

    #[test]
    fn test_start_with_missing_credentials_fails_and_stays_stopped() {
        let mut server = Server::builder()
            .port(0)
            .credentials_dir("/nonexistent/moat")
            .build();

        let result = server.start();

        assert!(matches!(result, Err(ServerError::Transport(_))));
        assert!(!server.is_running());
    }
}
