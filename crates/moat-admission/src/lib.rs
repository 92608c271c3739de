//! Admission control for Moat.
//!
//! Two pieces live here:
//!
//! - [`LiveConnections`]: the number of connections that finished their
//!   TLS handshake and have not closed yet. Incremented by taking a
//!   [`LiveGuard`], decremented when the guard drops.
//! - [`AdmissionController`]: decides, on every accept-loop iteration,
//!   whether the server keeps accepting or takes a cooldown.
//!
//! # Back-pressure model
//!
//! ```text
//!            live >= max_connections
//! Listening ─────────────────────────→ Cooldown { until }
//!     ↑                                      │
//!     └──────────── resume() ────────────────┘
//!                (cooldown timer fired)
//! ```
//!
//! Back-pressure is binary: during a cooldown no connection at all is
//! accepted, even if slots free up in the meantime. The listening socket
//! stays bound, so new clients queue in its backlog until the cooldown ends.

mod controller;
mod counter;

pub use controller::{Admission, AdmissionConfig, AdmissionController, AdmissionState};
pub use counter::{LiveConnections, LiveGuard};
