//! Per-connection session: handshake, read, process, write, close.
//!
//! Each accepted socket gets its own Tokio task running [`Session::run`].
//! The task owns everything about the connection, so the stages of one
//! connection never run concurrently, even though consecutive stages may
//! run on different worker threads. The flow is:
//!
//! ```text
//! Accepted → Handshaking ──ok──→ Reading ⇄ Processing → Writing ─┐
//!               │                   │          │            │     │
//!               └── error ──────────┴──────────┴────────────┴─────┴─→ Closing
//! ```
//!
//! Every path ends in exactly one `Closing` step. Errors are logged and
//! never retried.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use moat_admission::{LiveConnections, LiveGuard};
use moat_protocol::{EchoPolicy, EchoPolicyKind};
use moat_registry::{ClientRegistry, ConnectionId};
use moat_transport::SecureTransport;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Bytes read from the peer per read call.
pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Upper bound on the TLS close_notify + socket shutdown at close time.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The application protocol finished (or the peer ended the stream).
    Completed,
    /// The secure handshake failed; the connection was never counted live.
    HandshakeFailed,
    /// Reading from the peer failed.
    ReadFailed,
    /// Writing to the peer failed.
    WriteFailed,
    /// The echo policy refused the input.
    PolicyFailed,
    /// The peer sent nothing, or did not finish its handshake, within the
    /// configured idle timeout.
    IdleTimeout,
}

/// What every session of one server shares.
pub(crate) struct SessionContext<T: SecureTransport> {
    pub(crate) transport: Arc<T>,
    pub(crate) live: LiveConnections,
    pub(crate) policy: EchoPolicyKind,
    pub(crate) accumulate_limit: Option<usize>,
    pub(crate) idle_timeout: Option<Duration>,
}

/// Owns a connection's registry entry and its live-counter slot.
///
/// Dropping the guard releases the id and (if the connection was counted)
/// decrements the live counter. This runs on the normal close path, on
/// every error path, and when the pool shuts down with the session still
/// pending.
pub(crate) struct SessionGuard {
    id: ConnectionId,
    registry: Arc<ClientRegistry>,
    live: Option<LiveGuard>,
}

impl SessionGuard {
    pub(crate) fn new(id: ConnectionId, registry: Arc<ClientRegistry>) -> Self {
        Self {
            id,
            registry,
            live: None,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let released = self.registry.release(self.id);
        if let Err(e) = &released {
            tracing::error!(id = %self.id, error = %e, "connection id released twice");
        }
        debug_assert!(released.is_ok(), "connection id {} released twice", self.id);
    }
}

/// One step of the state machine, carrying the data the next step needs.
enum Stage {
    Accepted,
    Handshaking,
    Reading,
    /// `len` bytes of the read buffer are new.
    Processing { len: usize, eof: bool },
    Writing { bytes: Vec<u8>, end: bool },
    Closing(SessionOutcome),
}

/// A single accepted connection, from accept to close.
pub(crate) struct Session<T: SecureTransport> {
    guard: SessionGuard,
    peer: Option<SocketAddr>,
    raw: Option<T::Raw>,
    stream: Option<T::Stream>,
    policy: Box<dyn EchoPolicy>,
    read_buf: Vec<u8>,
    ctx: Arc<SessionContext<T>>,
}

impl<T: SecureTransport> Session<T> {
    pub(crate) fn new(
        guard: SessionGuard,
        raw: T::Raw,
        peer: Option<SocketAddr>,
        ctx: Arc<SessionContext<T>>,
    ) -> Self {
        Self {
            guard,
            peer,
            raw: Some(raw),
            stream: None,
            policy: ctx.policy.build(ctx.accumulate_limit),
            read_buf: vec![0; READ_BUFFER_SIZE],
            ctx,
        }
    }

    fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    /// Drives the connection until it closes.
    pub(crate) async fn run(mut self) -> SessionOutcome {
        let mut stage = Stage::Accepted;
        loop {
            stage = match stage {
                Stage::Accepted => {
                    tracing::debug!(
                        id = %self.id(),
                        peer = ?self.peer,
                        policy = self.policy.name(),
                        "new client attempting to connect, handshake pending"
                    );
                    Stage::Handshaking
                }
                Stage::Handshaking => self.handshake().await,
                Stage::Reading => self.read().await,
                Stage::Processing { len, eof } => self.process(len, eof),
                Stage::Writing { bytes, end } => self.write(bytes, end).await,
                Stage::Closing(outcome) => return self.close(outcome).await,
            };
        }
    }

    async fn handshake(&mut self) -> Stage {
        let id = self.id();
        let Some(raw) = self.raw.take() else {
            return Stage::Closing(SessionOutcome::HandshakeFailed);
        };

        tracing::debug!(%id, "handshake attempt");
        let handshake = self.ctx.transport.handshake(raw);
        let result = match self.ctx.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::info!(%id, timeout_ms = limit.as_millis() as u64, "handshake stalled, closing");
                    return Stage::Closing(SessionOutcome::IdleTimeout);
                }
            },
            None => handshake.await,
        };

        match result {
            Ok(stream) => {
                self.stream = Some(stream);
                self.guard.live = Some(self.ctx.live.acquire());
                tracing::info!(%id, live = self.ctx.live.current(), "handshake successful");
                Stage::Reading
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "handshake failed");
                Stage::Closing(SessionOutcome::HandshakeFailed)
            }
        }
    }

    async fn read(&mut self) -> Stage {
        let id = self.id();
        let Some(stream) = self.stream.as_mut() else {
            return Stage::Closing(SessionOutcome::ReadFailed);
        };

        let read = stream.read(&mut self.read_buf);
        let result = match self.ctx.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::info!(%id, timeout_ms = limit.as_millis() as u64, "connection idle, closing");
                    return Stage::Closing(SessionOutcome::IdleTimeout);
                }
            },
            None => read.await,
        };

        match result {
            Ok(0) => Stage::Processing { len: 0, eof: true },
            Ok(len) => {
                tracing::debug!(%id, bytes = len, "message received");
                Stage::Processing { len, eof: false }
            }
            Err(e) if is_end_of_stream(&e) => {
                tracing::debug!(%id, error = %e, "peer ended the stream");
                Stage::Processing { len: 0, eof: true }
            }
            Err(e) => {
                tracing::warn!(%id, error = %e, "read failed");
                Stage::Closing(SessionOutcome::ReadFailed)
            }
        }
    }

    fn process(&mut self, len: usize, eof: bool) -> Stage {
        let id = self.id();
        let chunk = &self.read_buf[..len];
        tracing::trace!(
            target: "moat::wire",
            %id,
            eof,
            data = %String::from_utf8_lossy(chunk),
            "received"
        );

        match self.policy.process(chunk, eof) {
            Ok(reply) if !reply.bytes.is_empty() => Stage::Writing {
                bytes: reply.bytes,
                end: reply.end,
            },
            Ok(reply) if reply.end => Stage::Closing(SessionOutcome::Completed),
            Ok(_) => Stage::Reading,
            Err(e) => {
                tracing::warn!(%id, error = %e, "message rejected");
                Stage::Closing(SessionOutcome::PolicyFailed)
            }
        }
    }

    async fn write(&mut self, bytes: Vec<u8>, end: bool) -> Stage {
        let id = self.id();
        let Some(stream) = self.stream.as_mut() else {
            return Stage::Closing(SessionOutcome::WriteFailed);
        };

        let written = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(%id, error = %e, "write failed");
            return Stage::Closing(SessionOutcome::WriteFailed);
        }

        tracing::debug!(%id, bytes = bytes.len(), "bytes sent to client");
        tracing::trace!(
            target: "moat::wire",
            %id,
            data = %String::from_utf8_lossy(&bytes),
            "sent"
        );

        if end {
            Stage::Closing(SessionOutcome::Completed)
        } else {
            Stage::Reading
        }
    }

    /// Terminal step. Consumes the session, so it runs exactly once.
    async fn close(mut self, outcome: SessionOutcome) -> SessionOutcome {
        let id = self.id();

        if let Some(mut stream) = self.stream.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(%id, error = %e, "shutdown failed"),
                Err(_) => tracing::debug!(%id, "shutdown timed out"),
            }
        }

        // Dropping the session below closes the socket, releases the id and
        // un-counts the connection.
        tracing::info!(%id, ?outcome, "connection closed");
        outcome
    }
}

/// End-of-stream conditions that are not treated as failures.
///
/// A peer that drops the TCP connection without a TLS close_notify shows
/// up as `UnexpectedEof`.
fn is_end_of_stream(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::PermissionDenied
    )
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! State-machine tests over in-memory duplex pipes.
    //!
    //! The "transports" here stand in for TLS: `Passthrough` hands the raw
    //! pipe straight back, `Rejecting` fails every handshake, and `Faulty`
    //! wraps the pipe in a stream that fails reads or writes on demand.

    use std::pin::Pin;
    use std::task::{Context, Poll};

    use moat_transport::TransportError;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    use super::*;

    // -- Transports -------------------------------------------------------

    struct Passthrough;

    impl SecureTransport for Passthrough {
        type Raw = DuplexStream;
        type Stream = DuplexStream;

        async fn handshake(&self, raw: DuplexStream) -> Result<DuplexStream, TransportError> {
            Ok(raw)
        }
    }

    struct Rejecting;

    impl SecureTransport for Rejecting {
        type Raw = DuplexStream;
        type Stream = DuplexStream;

        async fn handshake(&self, _raw: DuplexStream) -> Result<DuplexStream, TransportError> {
            Err(TransportError::Handshake(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad client hello",
            )))
        }
    }

    /// A peer that connects and never finishes its handshake.
    struct Stalling;

    impl SecureTransport for Stalling {
        type Raw = DuplexStream;
        type Stream = DuplexStream;

        async fn handshake(&self, _raw: DuplexStream) -> Result<DuplexStream, TransportError> {
            std::future::pending().await
        }
    }

    struct Faulty {
        fail_reads: bool,
        fail_writes: bool,
    }

    impl SecureTransport for Faulty {
        type Raw = DuplexStream;
        type Stream = FaultyStream;

        async fn handshake(&self, raw: DuplexStream) -> Result<FaultyStream, TransportError> {
            Ok(FaultyStream {
                inner: raw,
                fail_reads: self.fail_reads,
                fail_writes: self.fail_writes,
            })
        }
    }

    struct FaultyStream {
        inner: DuplexStream,
        fail_reads: bool,
        fail_writes: bool,
    }

    impl AsyncRead for FaultyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.fail_reads {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "injected read failure",
                )));
            }
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for FaultyStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail_writes {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "injected write failure",
                )));
            }
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    // -- Helpers ----------------------------------------------------------

    struct Harness<T: SecureTransport> {
        registry: Arc<ClientRegistry>,
        live: LiveConnections,
        ctx: Arc<SessionContext<T>>,
    }

    impl<T: SecureTransport<Raw = DuplexStream>> Harness<T> {
        fn new(transport: T, policy: EchoPolicyKind) -> Self {
            Self::with_options(transport, policy, None, None)
        }

        fn with_options(
            transport: T,
            policy: EchoPolicyKind,
            accumulate_limit: Option<usize>,
            idle_timeout: Option<Duration>,
        ) -> Self {
            let live = LiveConnections::new();
            Self {
                registry: Arc::new(ClientRegistry::new()),
                live: live.clone(),
                ctx: Arc::new(SessionContext {
                    transport: Arc::new(transport),
                    live,
                    policy,
                    accumulate_limit,
                    idle_timeout,
                }),
            }
        }

        /// Spawns a session over a duplex pipe and returns the client end.
        fn spawn(
            &self,
            pipe_capacity: usize,
        ) -> (ConnectionId, DuplexStream, tokio::task::JoinHandle<SessionOutcome>) {
            let (client, server) = tokio::io::duplex(pipe_capacity);
            let id = self.registry.allocate();
            let guard = SessionGuard::new(id, Arc::clone(&self.registry));
            let session = Session::new(guard, server, None, Arc::clone(&self.ctx));
            (id, client, tokio::spawn(session.run()))
        }

        fn assert_cleaned_up(&self, id: ConnectionId) {
            assert!(!self.registry.is_active(id), "id must be released");
            assert!(self.registry.is_empty());
            assert_eq!(self.live.current(), 0, "live counter must be back to 0");
        }
    }

    // =====================================================================
    // Happy paths
    // =====================================================================

    #[tokio::test]
    async fn test_immediate_echoes_each_message_before_next_read() {
        let harness = Harness::new(Passthrough, EchoPolicyKind::Immediate);
        let (id, mut client, session) = harness.spawn(1024);

        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        // Mid-connection: counted live and registered.
        assert_eq!(harness.live.current(), 1);
        assert!(harness.registry.is_active(id));

        client.write_all(b"pong").await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        client.shutdown().await.unwrap();
        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_accumulate_reassembles_partial_reads() {
        // A 4-byte pipe forces the server to read the message in pieces.
        let harness = Harness::new(Passthrough, EchoPolicyKind::Accumulate);
        let (id, client, session) = harness.spawn(4);
        let (mut rx, mut tx) = tokio::io::split(client);

        let message = b"a message much longer than the pipe".to_vec();
        let sent = message.clone();
        let writer = tokio::spawn(async move {
            tx.write_all(&sent).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut echoed = Vec::new();
        rx.read_to_end(&mut echoed).await.unwrap();
        writer.await.unwrap();

        assert_eq!(echoed, message);
        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_accumulate_writes_nothing_before_eof() {
        let harness = Harness::new(Passthrough, EchoPolicyKind::Accumulate);
        let (_id, mut client, session) = harness.spawn(1024);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 1];
        let early = tokio::time::timeout(Duration::from_millis(50), client.read(&mut buf)).await;
        assert!(early.is_err(), "accumulate must not reply before eof");

        client.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();

        assert_eq!(echoed, b"hello");
        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_peer_eof_without_data_completes() {
        let harness = Harness::new(Passthrough, EchoPolicyKind::Immediate);
        let (id, mut client, session) = harness.spawn(1024);

        client.shutdown().await.unwrap();

        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_peer_dropping_connection_completes() {
        let harness = Harness::new(Passthrough, EchoPolicyKind::Immediate);
        let (id, client, session) = harness.spawn(1024);

        drop(client);

        assert_eq!(session.await.unwrap(), SessionOutcome::Completed);
        harness.assert_cleaned_up(id);
    }

    // =====================================================================
    // Error paths: every one ends in exactly one close
    // =====================================================================

    #[tokio::test]
    async fn test_handshake_failure_closes_without_counting() {
        let harness = Harness::new(Rejecting, EchoPolicyKind::Immediate);
        let mut changes = harness.live.subscribe();
        let (id, _client, session) = harness.spawn(1024);

        assert_eq!(session.await.unwrap(), SessionOutcome::HandshakeFailed);
        assert!(
            !changes.has_changed().unwrap(),
            "a failed handshake must never touch the live counter"
        );
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_read_failure_closes_and_uncounts() {
        let transport = Faulty {
            fail_reads: true,
            fail_writes: false,
        };
        let harness = Harness::new(transport, EchoPolicyKind::Immediate);
        let mut changes = harness.live.subscribe();
        let (id, _client, session) = harness.spawn(1024);

        assert_eq!(session.await.unwrap(), SessionOutcome::ReadFailed);
        assert!(changes.has_changed().unwrap(), "handshake was counted");
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_write_failure_closes_and_uncounts() {
        let transport = Faulty {
            fail_reads: false,
            fail_writes: true,
        };
        let harness = Harness::new(transport, EchoPolicyKind::Immediate);
        let (id, mut client, session) = harness.spawn(1024);

        client.write_all(b"ping").await.unwrap();

        assert_eq!(session.await.unwrap(), SessionOutcome::WriteFailed);
        harness.assert_cleaned_up(id);
    }

    #[tokio::test]
    async fn test_policy_failure_closes_without_reply() {
        let harness =
            Harness::with_options(Passthrough, EchoPolicyKind::Accumulate, Some(4), None);
        let (id, mut client, session) = harness.spawn(1024);

        client.write_all(b"too long").await.unwrap();

        assert_eq!(session.await.unwrap(), SessionOutcome::PolicyFailed);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no error payload is sent back");
        harness.assert_cleaned_up(id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_silent_peer() {
        let harness = Harness::with_options(
            Passthrough,
            EchoPolicyKind::Immediate,
            None,
            Some(Duration::from_secs(30)),
        );
        let (id, _client, session) = harness.spawn(1024);

        assert_eq!(session.await.unwrap(), SessionOutcome::IdleTimeout);
        harness.assert_cleaned_up(id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_stalled_handshake() {
        let harness = Harness::with_options(
            Stalling,
            EchoPolicyKind::Immediate,
            None,
            Some(Duration::from_millis(200)),
        );
        let mut changes = harness.live.subscribe();
        let (id, mut client, session) = harness.spawn(1024);

        assert_eq!(session.await.unwrap(), SessionOutcome::IdleTimeout);
        assert!(!changes.has_changed().unwrap(), "never counted live");
        harness.assert_cleaned_up(id);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "socket is closed");
    }

    #[tokio::test]
    async fn test_many_concurrent_sessions_all_clean_up() {
        let harness = Harness::new(Passthrough, EchoPolicyKind::Immediate);

        let mut clients = Vec::new();
        for i in 0..64u32 {
            let (_id, mut client, session) = harness.spawn(1024);
            clients.push(tokio::spawn(async move {
                let msg = i.to_be_bytes();
                client.write_all(&msg).await.unwrap();
                let mut reply = [0u8; 4];
                client.read_exact(&mut reply).await.unwrap();
                assert_eq!(reply, msg);
                client.shutdown().await.unwrap();
                session.await.unwrap()
            }));
        }

        for client in clients {
            assert_eq!(client.await.unwrap(), SessionOutcome::Completed);
        }
        assert!(harness.registry.is_empty());
        assert_eq!(harness.live.current(), 0);
    }

    // =====================================================================
    // SessionGuard
    // =====================================================================

    #[test]
    fn test_guard_drop_releases_id_and_uncounts() {
        let registry = Arc::new(ClientRegistry::new());
        let live = LiveConnections::new();
        let id = registry.allocate();

        let mut guard = SessionGuard::new(id, Arc::clone(&registry));
        guard.live = Some(live.acquire());
        assert_eq!(live.current(), 1);

        drop(guard);

        assert!(!registry.is_active(id));
        assert_eq!(live.current(), 0);
    }
}
