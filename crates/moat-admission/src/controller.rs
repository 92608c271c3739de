//! The admission controller: Listening vs. Cooldown.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::LiveConnections;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Limits enforced by the [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Number of live connections at which the server stops accepting.
    pub max_connections: usize,
    /// How long accepting stays paused once the ceiling is hit.
    pub cooldown: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            cooldown: Duration::from_secs(5),
        }
    }
}

impl AdmissionConfig {
    /// Clamp out-of-range values so the config is safe to use.
    ///
    /// - `max_connections` of 0 would mean "never accept"; raised to 1.
    pub fn validated(mut self) -> Self {
        if self.max_connections == 0 {
            tracing::warn!("max_connections of 0 requested, using 1");
            self.max_connections = 1;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Whether the listener is currently accepting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Accepting new connections.
    Listening,
    /// Not accepting until `until`.
    Cooldown {
        /// When the cooldown timer fires.
        until: Instant,
    },
}

/// Verdict of one [`AdmissionController::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead and accept the next connection.
    Accept,
    /// Stop accepting and sleep for the given duration first.
    CoolDown(Duration),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Gates connection acceptance against the live-connection ceiling.
///
/// Shared by the accept loop (which calls [`check`](Self::check) and
/// [`resume`](Self::resume)) and by observers such as the server's
/// diagnostics accessors.
#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    live: LiveConnections,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    /// Creates a controller in the Listening state.
    pub fn new(config: AdmissionConfig, live: LiveConnections) -> Self {
        Self {
            config: config.validated(),
            live,
            state: Mutex::new(AdmissionState::Listening),
        }
    }

    /// Decides whether the accept loop may accept another connection.
    ///
    /// While Listening, reaching `max_connections` live connections moves
    /// the controller into Cooldown for the configured duration. While
    /// already in Cooldown, the remaining time is reported.
    pub fn check(&self) -> Admission {
        let mut state = self.lock();

        if let AdmissionState::Cooldown { until } = *state {
            return Admission::CoolDown(until.saturating_duration_since(Instant::now()));
        }

        let live = self.live.current();
        if live < self.config.max_connections {
            return Admission::Accept;
        }

        *state = AdmissionState::Cooldown {
            until: Instant::now() + self.config.cooldown,
        };
        tracing::warn!(
            live,
            max_connections = self.config.max_connections,
            cooldown_ms = self.config.cooldown.as_millis() as u64,
            "max connections reached, entering cooldown"
        );
        Admission::CoolDown(self.config.cooldown)
    }

    /// Ends a cooldown. Called when the cooldown timer fires.
    pub fn resume(&self) {
        let mut state = self.lock();
        if matches!(*state, AdmissionState::Cooldown { .. }) {
            *state = AdmissionState::Listening;
            tracing::info!("cooldown over, listening again");
        }
    }

    /// Current state.
    pub fn state(&self) -> AdmissionState {
        *self.lock()
    }

    /// Returns `true` while Listening.
    pub fn is_listening(&self) -> bool {
        matches!(self.state(), AdmissionState::Listening)
    }

    /// The live-connection counter this controller watches.
    pub fn live(&self) -> &LiveConnections {
        &self.live
    }

    /// The (validated) configuration.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
