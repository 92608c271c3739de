//! Error types for the registry.

use crate::ConnectionId;

/// Errors reported by the [`ClientRegistry`](crate::ClientRegistry).
///
/// These are lifecycle violations, not I/O failures: a correct server
/// never produces them. Callers should log them loudly and fail tests
/// on them instead of swallowing them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The id was released but is not in the active set.
    ///
    /// Either it was released twice, or it was never allocated by this
    /// registry in the first place.
    #[error("connection id {0} is not active")]
    NotActive(ConnectionId),
}
