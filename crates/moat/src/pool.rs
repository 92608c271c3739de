//! The reactor pool: a fixed set of worker threads driving every socket.
//!
//! All workers share one I/O driver, one timer driver and one task queue,
//! so a connection's next step runs on whichever worker is free.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::ServerError;

/// How long [`ReactorPool::stop`] waits for workers to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns the multi-threaded Tokio runtime the server runs on.
///
/// The pool is started and stopped from the controlling thread. Calling
/// [`stop`](Self::stop) (or dropping the pool) from inside one of its own
/// workers cannot join that worker; in that case the runtime is released
/// in the background instead.
#[derive(Debug)]
pub struct ReactorPool {
    worker_threads: usize,
    runtime: Option<Runtime>,
}

impl ReactorPool {
    /// Creates a stopped pool that will run `worker_threads` workers.
    pub fn new(worker_threads: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            runtime: None,
        }
    }

    /// Spawns the worker threads. Does nothing if already running.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.runtime.is_some() {
            return Ok(());
        }

        let next_worker = Arc::new(AtomicUsize::new(0));
        let runtime = Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name_fn(move || {
                let n = next_worker.fetch_add(1, Ordering::Relaxed);
                format!("moat-worker-{n}")
            })
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        tracing::info!(workers = self.worker_threads, "reactor pool started");
        self.runtime = Some(runtime);
        Ok(())
    }

    /// Shuts the runtime down and joins its workers. Idempotent.
    ///
    /// Tasks still pending are dropped, which closes their sockets and
    /// runs their drop guards.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            tracing::warn!("reactor pool stopped from async context, not joining workers");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
        tracing::info!("reactor pool stopped");
    }

    /// Whether the workers are running.
    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Number of worker threads the pool runs with.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Schedules a task on the pool.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, ServerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Ok(self.runtime()?.spawn(future))
    }

    /// Runs a future to completion on the pool, blocking the caller.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async context.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ServerError> {
        Ok(self.runtime()?.block_on(future))
    }

    /// A handle for entering the pool's context.
    pub fn handle(&self) -> Result<&Handle, ServerError> {
        Ok(self.runtime()?.handle())
    }

    fn runtime(&self) -> Result<&Runtime, ServerError> {
        self.runtime.as_ref().ok_or(ServerError::NotRunning)
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        self.stop();
    }
}
