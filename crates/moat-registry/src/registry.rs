//! The client registry: allocates connection ids and tracks which are live.
//!
//! # Concurrency note
//!
//! Unlike the rest of the per-connection state, the registry is shared by
//! every connection task and touched from whichever worker thread a task
//! happens to run on. All state sits behind a single `RwLock`:
//!
//! - `allocate()`, `candidate()`, `claim()` and `release()` take the
//!   write lock,
//! - `is_active()` and `len()` take the read lock.
//!
//! Allocation checks a candidate against the active set and inserts it
//! inside one write critical section. Two concurrent allocations can
//! therefore never both observe the same free candidate.
//!
//! Drawing a candidate can be split from claiming it: `candidate()` only
//! advances the generator, and nothing enters the active set until
//! `claim()` runs. The accept loop draws while `accept()` is pending and
//! claims once a socket actually exists.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{ConnectionId, RegistryError};

/// The mutable part of the registry. Only ever touched under the lock.
struct Inner {
    /// Ids handed out by `allocate()` and not yet released.
    active: HashSet<ConnectionId>,
    /// Source of candidate ids.
    rng: StdRng,
}

/// Allocates collision-free [`ConnectionId`]s and tracks which are live.
///
/// ## Lifecycle of an id
///
/// ```text
/// candidate() ──→ claim() ──┐
///                            ├──→ [active] ──→ release() ──→ [free, may be reused]
/// allocate() ────────────────┘       │
///                                    └── release() again ──→ Err(NotActive)
/// ```
pub struct ClientRegistry {
    inner: RwLock<Inner>,
}

impl ClientRegistry {
    /// Creates an empty registry seeded from the operating system.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Creates an empty registry with a deterministic generator.
    ///
    /// Two registries built from the same seed hand out the same sequence
    /// of candidates, which makes the collision path reproducible.
    pub fn with_rng_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            inner: RwLock::new(Inner {
                active: HashSet::new(),
                rng,
            }),
        }
    }

    /// Returns a fresh id and marks it active.
    ///
    /// Draws uniformly random 64-bit candidates, resampling while the
    /// candidate is already active. The returned id is a member of the
    /// active set when this call returns.
    pub fn allocate(&self) -> ConnectionId {
        let mut inner = self.write();
        let first = ConnectionId::new(inner.rng.random());
        inner.claim(first)
    }

    /// Draws a random candidate id without marking it active.
    ///
    /// The candidate is not reserved. Pass it to [`claim`](Self::claim)
    /// once it is needed; dropping it leaves the registry untouched.
    pub fn candidate(&self) -> ConnectionId {
        ConnectionId::new(self.write().rng.random())
    }

    /// Marks `candidate` active, or a freshly drawn id if `candidate` was
    /// taken since it was drawn. Returns the id that is now active.
    pub fn claim(&self, candidate: ConnectionId) -> ConnectionId {
        self.write().claim(candidate)
    }

    /// Removes `id` from the active set.
    ///
    /// # Errors
    /// Returns [`RegistryError::NotActive`] if the id is not currently
    /// active. That means a double release or a foreign id, a bug in
    /// the caller's lifecycle handling.
    pub fn release(&self, id: ConnectionId) -> Result<(), RegistryError> {
        let mut inner = self.write();
        if !inner.active.remove(&id) {
            return Err(RegistryError::NotActive(id));
        }
        tracing::trace!(%id, active = inner.active.len(), "connection id released");
        Ok(())
    }

    /// Returns `true` if `id` is currently allocated.
    pub fn is_active(&self, id: ConnectionId) -> bool {
        self.read().active.contains(&id)
    }

    /// Number of currently allocated ids.
    pub fn len(&self) -> usize {
        self.read().active.len()
    }

    /// Returns `true` if no id is allocated.
    pub fn is_empty(&self) -> bool {
        self.read().active.is_empty()
    }

    // A panic while holding the lock cannot leave the set half-updated
    // (every mutation is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    /// Inserts `candidate`, resampling while it collides.
    fn claim(&mut self, mut candidate: ConnectionId) -> ConnectionId {
        let mut collisions = 0u32;
        while !self.active.insert(candidate) {
            collisions += 1;
            candidate = ConnectionId::new(self.rng.random());
        }

        if collisions > 0 {
            tracing::debug!(id = %candidate, collisions, "connection id resampled");
        }
        tracing::trace!(id = %candidate, active = self.active.len(), "connection id allocated");
        candidate
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Tests
// =========================================================================
