//! Echo policies: what to write back for the bytes that were read.
//!
//! A policy is a small state machine owned by one connection. The session
//! feeds it every chunk it reads (and a final empty chunk with `eof = true`
//! when the peer ends its side) and writes back whatever [`Reply`] says.
//!
//! Because each connection owns its own policy value, a policy never needs
//! any locking: the session never runs two stages at the same time.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// The outcome of processing one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Bytes to write to the peer. May be empty.
    pub bytes: Vec<u8>,
    /// `true` if the connection should close after writing `bytes`.
    pub end: bool,
}

impl Reply {
    /// Nothing to write, keep reading.
    pub fn pending() -> Self {
        Self::default()
    }
}

/// Decides what the server writes back for the bytes it receives.
///
/// ## Trait bounds
///
/// - `Send` → the connection task holding the policy may move between
///   worker threads at every `.await`.
/// - `'static` → the policy lives as long as its connection task.
pub trait EchoPolicy: Send + 'static {
    /// Processes one chunk.
    ///
    /// `eof` is `true` when the peer has ended its side of the stream; in
    /// that case `chunk` holds whatever was read together with the end of
    /// stream (usually nothing).
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the connection cannot continue.
    fn process(&mut self, chunk: &[u8], eof: bool) -> Result<Reply, ProtocolError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Immediate
// ---------------------------------------------------------------------------

/// Writes every chunk straight back.
///
/// ```rust
/// use moat_protocol::{EchoPolicy, Immediate};
///
/// let mut policy = Immediate;
/// let reply = policy.process(b"ping", false).unwrap();
/// assert_eq!(reply.bytes, b"ping");
/// assert!(!reply.end);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl EchoPolicy for Immediate {
    fn process(&mut self, chunk: &[u8], eof: bool) -> Result<Reply, ProtocolError> {
        Ok(Reply {
            bytes: chunk.to_vec(),
            end: eof,
        })
    }

    fn name(&self) -> &'static str {
        "immediate"
    }
}

// ---------------------------------------------------------------------------
// Accumulate
// ---------------------------------------------------------------------------

/// Buffers everything until end of stream, then writes it back once.
///
/// ```rust
/// use moat_protocol::{Accumulate, EchoPolicy};
///
/// let mut policy = Accumulate::new(None);
/// assert!(policy.process(b"hel", false).unwrap().bytes.is_empty());
/// assert!(policy.process(b"lo", false).unwrap().bytes.is_empty());
///
/// let reply = policy.process(b"", true).unwrap();
/// assert_eq!(reply.bytes, b"hello");
/// assert!(reply.end);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Accumulate {
    buffer: Vec<u8>,
    limit: Option<usize>,
}

impl Accumulate {
    /// Creates an empty accumulator. `limit` caps the buffered message
    /// size in bytes; `None` means unbounded.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    /// Bytes buffered so far.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl EchoPolicy for Accumulate {
    fn process(&mut self, chunk: &[u8], eof: bool) -> Result<Reply, ProtocolError> {
        if let Some(limit) = self.limit {
            if self.buffer.len() + chunk.len() > limit {
                return Err(ProtocolError::BufferLimit { limit });
            }
        }
        self.buffer.extend_from_slice(chunk);

        if !eof {
            return Ok(Reply::pending());
        }
        Ok(Reply {
            bytes: std::mem::take(&mut self.buffer),
            end: true,
        })
    }

    fn name(&self) -> &'static str {
        "accumulate"
    }
}

// ---------------------------------------------------------------------------
// EchoPolicyKind
// ---------------------------------------------------------------------------

/// Which [`EchoPolicy`] a server uses, as named in configuration.
///
/// Serialized in `snake_case`: `"immediate"` or `"accumulate"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicyKind {
    /// See [`Immediate`].
    #[default]
    Immediate,
    /// See [`Accumulate`].
    Accumulate,
}

impl EchoPolicyKind {
    /// Builds a fresh policy for one connection.
    ///
    /// `accumulate_limit` only applies to [`EchoPolicyKind::Accumulate`].
    pub fn build(self, accumulate_limit: Option<usize>) -> Box<dyn EchoPolicy> {
        match self {
            Self::Immediate => Box::new(Immediate),
            Self::Accumulate => Box::new(Accumulate::new(accumulate_limit)),
        }
    }
}
