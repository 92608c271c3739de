//! Connection identity registry for Moat.
//!
//! Every accepted connection gets a [`ConnectionId`] for the time it is
//! alive. Ids are random 64-bit values, unique among the connections that
//! are currently open. Once a connection closes, its id goes back into
//! the pool and may be handed out again.
//!
//! # How it fits in the stack
//!
//! ```text
//! Server accept loop  ← draws a candidate while accepting, claims it per socket
//!     ↕
//! Registry (this crate)  ← owns the set of active ids
//!     ↕
//! Session close  ← releases the id exactly once
//! ```

mod error;
mod id;
mod registry;

pub use error::RegistryError;
pub use id::ConnectionId;
pub use registry::ClientRegistry;
