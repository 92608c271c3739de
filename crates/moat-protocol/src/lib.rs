//! Application protocol for Moat.
//!
//! After the TLS handshake a connection is a plain byte pipe. What the
//! server sends back for the bytes it receives is decided by an
//! [`EchoPolicy`]:
//!
//! - [`Immediate`]: every chunk read is written straight back; the
//!   connection ends when the peer ends its side.
//! - [`Accumulate`]: chunks are buffered until the peer ends its side,
//!   then the whole message is written back once and the connection ends.
//!
//! The policy is picked per server with [`EchoPolicyKind`], which is what
//! configuration files name.
//!
//! ```text
//! Transport (TLS bytes) → Protocol (EchoPolicy) → Reply { bytes, end }
//! ```

mod error;
mod policy;

pub use error::ProtocolError;
pub use policy::{Accumulate, EchoPolicy, EchoPolicyKind, Immediate, Reply};
