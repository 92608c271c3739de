//! Error types for the protocol layer.

/// Errors an [`EchoPolicy`](crate::EchoPolicy) can report.
///
/// A policy error ends the connection; nothing is written back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The accumulated message grew past the configured limit.
    #[error("accumulated message exceeds {limit} bytes")]
    BufferLimit {
        /// The configured limit in bytes.
        limit: usize,
    },
}
