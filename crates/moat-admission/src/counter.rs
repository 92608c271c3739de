//! The live-connection counter.
//!
//! The count lives in a `tokio::sync::watch` channel. That gives us two
//! things at once: a lock around every update (`send_modify`) and a way for
//! the accept loop to be woken up whenever the count changes.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts connections that completed their handshake and are still open.
///
/// Cloning is cheap and every clone observes the same count.
#[derive(Debug, Clone)]
pub struct LiveConnections {
    tx: Arc<watch::Sender<usize>>,
}

impl LiveConnections {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    /// Counts one more live connection.
    ///
    /// The returned guard un-counts it when dropped, so every increment is
    /// matched by exactly one decrement.
    #[must_use = "dropping the guard immediately un-counts the connection"]
    pub fn acquire(&self) -> LiveGuard {
        self.tx.send_modify(|n| *n += 1);
        LiveGuard {
            tx: Arc::clone(&self.tx),
        }
    }

    /// Current number of live connections.
    pub fn current(&self) -> usize {
        *self.tx.borrow()
    }

    /// Returns a receiver that is notified on every change of the count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.tx.subscribe()
    }
}

impl Default for LiveConnections {
    fn default() -> Self {
        Self::new()
    }
}

/// One counted connection. Decrements the counter on drop.
#[derive(Debug)]
pub struct LiveGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut underflow = false;
        self.tx.send_modify(|n| match n.checked_sub(1) {
            Some(next) => *n = next,
            None => underflow = true,
        });
        if underflow {
            tracing::error!("live connection counter would go negative");
        }
    }
}
