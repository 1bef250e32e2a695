//! Bounded task manager over the shared `tokio` executor.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{KernelError, KernelResult};

/// How long `shutdown` waits for tasks to drain before aborting them.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Concurrency settings for the task manager.
#[derive(Debug, Clone, Copy)]
pub struct TaskManagerConfig {
    max_concurrency: NonZeroUsize,
}

impl TaskManagerConfig {
    /// Creates a configuration with the supplied concurrency limit.
    #[must_use]
    pub const fn new(max_concurrency: NonZeroUsize) -> Self {
        Self { max_concurrency }
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub const fn max_concurrency(self) -> NonZeroUsize {
        self.max_concurrency
    }
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        let fallback = NonZeroUsize::new(4).expect("non-zero");
        Self::new(std::thread::available_parallelism().unwrap_or(fallback))
    }
}

/// Accepts fire-and-forget closures and long-lived awaitables, enforcing a
/// concurrency cap over the shared executor.
///
/// Submission order is FIFO but execution order across worker threads is
/// not guaranteed. There is no forced cancellation: awaitables exit
/// cooperatively through their own stop signals, and [`shutdown`] merely
/// waits for them (aborting only past a drain deadline).
///
/// [`shutdown`]: TaskManager::shutdown
pub struct TaskManager {
    semaphore: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    config: TaskManagerConfig,
}

impl TaskManager {
    /// Constructs a task manager using the provided configuration.
    #[must_use]
    pub fn new(config: TaskManagerConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency().get())),
            closed: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Returns the associated configuration.
    #[must_use]
    pub const fn config(&self) -> TaskManagerConfig {
        self.config
    }

    /// Returns `true` once the manager stopped accepting submissions.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns an awaitable, respecting the concurrency limit.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Closed`] when submitted after shutdown began;
    /// the task is dropped with a warning.
    pub fn enqueue_task<F>(&self, future: F) -> KernelResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            warn!("task submitted after shutdown was dropped");
            return Err(KernelError::Closed);
        }

        let semaphore = Arc::clone(&self.semaphore);
        let handle = tokio::spawn(async move {
            // A closed semaphore means shutdown raced the submission; the
            // task simply never runs.
            let Ok(permit) = semaphore.acquire_owned().await else {
                return;
            };
            future.await;
            drop(permit);
        });

        self.track(handle);
        Ok(())
    }

    /// Runs a blocking closure on the executor's blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Closed`] when submitted after shutdown began.
    pub fn enqueue_blocking<F>(&self, task: F) -> KernelResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            warn!("task submitted after shutdown was dropped");
            return Err(KernelError::Closed);
        }

        let handle = tokio::task::spawn_blocking(task);
        self.track(tokio::spawn(async move {
            let _ = handle.await;
        }));
        Ok(())
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Stops accepting work and drains the tracked tasks.
    ///
    /// Tasks are expected to exit via their own stop flags; anything still
    /// suspended past the drain deadline is aborted, mirroring an executor
    /// stop.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();

        let mut handles: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.handles));
        debug!(tasks = handles.len(), "draining task manager");

        let drain = futures::future::join_all(handles.iter_mut());
        if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
            warn!("some tasks did not drain in time, aborting them");
            for handle in &handles {
                handle.abort();
            }
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new(TaskManagerConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn respects_max_concurrency() {
        let config = TaskManagerConfig::new(NonZeroUsize::new(2).unwrap());
        let manager = TaskManager::new(config);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let in_flight = Arc::clone(&in_flight);
            let max_seen = Arc::clone(&max_seen);
            manager
                .enqueue_task(async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        manager.shutdown().await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejects_tasks_after_shutdown() {
        let manager = TaskManager::default();
        manager.shutdown().await;

        let result = manager.enqueue_task(async {});
        assert_eq!(result.unwrap_err(), KernelError::Closed);

        let result = manager.enqueue_blocking(|| {});
        assert_eq!(result.unwrap_err(), KernelError::Closed);
    }

    #[tokio::test]
    async fn shutdown_waits_for_tracked_tasks() {
        let manager = TaskManager::default();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let done = Arc::clone(&done);
            manager
                .enqueue_task(async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        manager.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn blocking_closures_run() {
        let manager = TaskManager::default();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = Arc::clone(&ran);
            manager
                .enqueue_blocking(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        manager.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
