//! Bounded pool for blocking sub-batch work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{ReplError, ReplResult};

/// What a [`WorkerPool::run_all`] call produced.
#[derive(Debug)]
pub struct Completed<T> {
    /// One entry per started task, in completion order. A panicking task
    /// yields a [`ReplError::WorkerPool`].
    pub results: Vec<ReplResult<T>>,
    /// Whether cancellation stopped tasks from being started.
    pub interrupted: bool,
    /// Total time started tasks spent waiting for a free worker.
    pub waited: Duration,
}

struct Running {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

/// Runs blocking tasks on a tokio runtime, at most `workers` at a time.
///
/// The pool is constructed stopped. [`start`](Self::start) binds it to a
/// runtime and [`stop`](Self::stop) closes it; tasks already running are
/// left to finish.
pub struct WorkerPool {
    name: String,
    workers: usize,
    running: Mutex<Option<Running>>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
            running: Mutex::new(None),
        }
    }

    /// Maximum number of tasks running at once.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Returns true between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Binds the pool to `runtime`. Starting a running pool does nothing.
    pub fn start(&self, runtime: Handle) {
        let mut running = self.running.lock();
        if running.is_some() {
            return;
        }
        debug!(pool = %self.name, workers = self.workers, "worker pool started");
        *running = Some(Running {
            runtime,
            permits: Arc::new(Semaphore::new(self.workers)),
        });
    }

    /// Closes the pool. Calls waiting for a worker fail; stopping a stopped
    /// pool does nothing.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.permits.close();
            debug!(pool = %self.name, "worker pool stopped");
        }
    }

    /// Runs every task and waits for the started ones to finish.
    ///
    /// Once `cancel` fires no further task is started. Must be called from
    /// a thread that is not driving an async task, such as a
    /// `spawn_blocking` thread.
    ///
    /// # Errors
    ///
    /// Fails if the pool is not running or is stopped while tasks wait for
    /// a worker.
    pub fn run_all<T, F>(
        &self,
        tasks: Vec<F>,
        cancel: &CancellationToken,
    ) -> ReplResult<Completed<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (runtime, permits) = {
            let running = self.running.lock();
            let running = running
                .as_ref()
                .ok_or_else(|| ReplError::WorkerPool(format!("pool {} is not running", self.name)))?;
            (running.runtime.clone(), Arc::clone(&running.permits))
        };
        let name = self.name.clone();
        runtime.block_on(scatter(name, permits, tasks, cancel.clone()))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn scatter<T, F>(
    name: String,
    permits: Arc<Semaphore>,
    tasks: Vec<F>,
    cancel: CancellationToken,
) -> ReplResult<Completed<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut set: JoinSet<T> = JoinSet::new();
    let mut interrupted = false;
    let mut waited = Duration::ZERO;
    let mut closed = None;

    for task in tasks {
        let asked = Instant::now();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
            permit = Arc::clone(&permits).acquire_owned() => permit,
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                closed = Some(ReplError::WorkerPool(format!("pool {name} stopped: {e}")));
                break;
            }
        };
        waited += asked.elapsed();
        set.spawn_blocking(move || {
            let _permit = permit;
            task()
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        results.push(joined.map_err(|e| {
            error!(pool = %name, error = %e, "pool task failed");
            ReplError::WorkerPool(format!("task on pool {name} failed: {e}"))
        }));
    }
    match closed {
        Some(e) => Err(e),
        None => Ok(Completed {
            results,
            interrupted,
            waited,
        }),
    }
}
