//! Admission-controlled worker pool.
//!
//! Two pieces work together:
//! - `AdmissionPool::try_admit` is the single capacity authority. It checks
//!   the live connection count against `max_size` and increments it in one
//!   atomic step, handing back a `Slot` that gives the count back on drop.
//! - The executor runs submitted tasks on up to `max_size` worker tasks fed
//!   by a bounded queue. Workers above `core_size` retire after sitting idle
//!   for `idle_timeout`.
//!
//! A new worker is started whenever no idle worker is free to take a task,
//! so the executor's concurrency matches the admission limit and an admitted
//! connection never waits in the queue behind busy workers.

use crate::error::PoolError;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A unit of work run by a pool worker.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive while idle
    pub core_size: usize,
    /// Upper bound on workers and on admitted connections
    pub max_size: usize,
    /// Tasks that may wait for a worker, raised to `max_size` if smaller
    pub queue_capacity: usize,
    /// How long a worker above `core_size` may sit idle
    #[serde(rename = "idle_timeout_secs", with = "secs")]
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_size: 2,
            max_size: 4,
            queue_capacity: 4,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Fixed-capacity pool deciding which connections get serviced.
pub struct AdmissionPool {
    config: PoolConfig,
    active: Arc<AtomicUsize>,
    executor: OnceLock<Arc<Executor>>,
}

impl AdmissionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicUsize::new(0)),
            executor: OnceLock::new(),
        }
    }

    /// Maximum number of simultaneously admitted connections.
    pub fn capacity(&self) -> usize {
        self.config.max_size
    }

    /// Number of admitted connections that have not yet released their slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of live pool workers.
    #[cfg(test)]
    pub fn workers(&self) -> usize {
        self.executor
            .get()
            .map_or(0, |executor| executor.lock_state().workers)
    }

    /// Claim a connection slot, or `None` when the pool is at capacity.
    pub fn try_admit(&self) -> Option<Slot> {
        let capacity = self.capacity();
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < capacity).then_some(count + 1)
            })
            .ok()
            .map(|_| Slot {
                active: Arc::clone(&self.active),
            })
    }

    /// Run a task on a pool worker.
    ///
    /// The executor is created on first use and must be called from within a
    /// Tokio runtime.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor
            .get_or_init(|| Executor::new(self.config))
            .submit(Box::pin(task))
    }
}

/// One admitted connection's claim on pool capacity.
///
/// The live count is decremented exactly once, when the slot is dropped.
#[derive(Debug)]
pub struct Slot {
    active: Arc<AtomicUsize>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct WorkerState {
    workers: usize,
    idle: usize,
    queued: usize,
}

struct Executor {
    config: PoolConfig,
    sender: mpsc::Sender<Task>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    state: Mutex<WorkerState>,
    next_worker_id: AtomicUsize,
}

impl Executor {
    fn new(config: PoolConfig) -> Arc<Self> {
        debug!(
            core_size = config.core_size,
            max_size = config.max_size,
            queue_capacity = config.queue_capacity,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Creating worker pool"
        );
        // A slot is freed before its worker reports idle, so an admitted task
        // can briefly queue behind every worker. The queue must hold one task
        // per admissible connection.
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(config.max_size).max(1));
        Arc::new(Self {
            config,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            state: Mutex::new(WorkerState::default()),
            next_worker_id: AtomicUsize::new(0),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(self: &Arc<Self>, task: Task) -> Result<(), PoolError> {
        let mut state = self.lock_state();

        // An idle worker not already spoken for will pick it off the queue
        if state.idle > state.queued {
            return self.enqueue(&mut state, task);
        }

        if state.workers < self.config.max_size {
            state.workers += 1;
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            debug!(worker = id, workers = state.workers, "Starting pool worker");
            tokio::spawn(Arc::clone(self).worker_loop(id, task));
            return Ok(());
        }

        self.enqueue(&mut state, task)
    }

    fn enqueue(&self, state: &mut WorkerState, task: Task) -> Result<(), PoolError> {
        match self.sender.try_send(task) {
            Ok(()) => {
                state.queued += 1;
                Ok(())
            }
            Err(_) => Err(PoolError::Saturated {
                workers: state.workers,
                queued: state.queued,
            }),
        }
    }

    async fn worker_loop(self: Arc<Self>, id: usize, first: Task) {
        run_task(id, first).await;
        self.lock_state().idle += 1;

        loop {
            let next = tokio::time::timeout(self.config.idle_timeout, async {
                self.receiver.lock().await.recv().await
            })
            .await;

            match next {
                Ok(Some(task)) => {
                    {
                        let mut state = self.lock_state();
                        state.queued -= 1;
                        state.idle -= 1;
                    }
                    run_task(id, task).await;
                    self.lock_state().idle += 1;
                }
                Ok(None) => {
                    let mut state = self.lock_state();
                    state.workers -= 1;
                    state.idle -= 1;
                    return;
                }
                Err(_) => {
                    let mut state = self.lock_state();
                    if state.workers > self.config.core_size && state.idle > state.queued {
                        state.workers -= 1;
                        state.idle -= 1;
                        debug!(worker = id, workers = state.workers, "Retiring idle pool worker");
                        return;
                    }
                }
            }
        }
    }
}

/// Run a task on its own Tokio task so a panic cannot take the worker down.
async fn run_task(worker: usize, task: Task) {
    if let Err(e) = tokio::spawn(task).await {
        error!(worker, error = %e, "Pool task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tokio::sync::{oneshot, Barrier as AsyncBarrier};

    fn config(core_size: usize, max_size: usize, queue_capacity: usize) -> PoolConfig {
        PoolConfig {
            core_size,
            max_size,
            queue_capacity,
            idle_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.core_size, 2);
        assert_eq!(config.max_size, 4);
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_from_toml() {
        let config: PoolConfig = toml::from_str("max_size = 8\nidle_timeout_secs = 5").unwrap();
        assert_eq!(config.core_size, 2);
        assert_eq!(config.max_size, 8);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_admission_bound() {
        let pool = AdmissionPool::new(config(1, 2, 2));

        let first = pool.try_admit().unwrap();
        let second = pool.try_admit().unwrap();
        assert!(pool.try_admit().is_none());
        assert_eq!(pool.active(), 2);

        drop(first);
        assert_eq!(pool.active(), 1);
        let third = pool.try_admit().unwrap();
        assert!(pool.try_admit().is_none());

        drop(second);
        drop(third);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_capacity() {
        let pool = AdmissionPool::new(PoolConfig::default());
        let barrier = Barrier::new(16);

        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        let slot = pool.try_admit();
                        barrier.wait();
                        slot.is_some()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| usize::from(handle.join().unwrap()))
                .sum()
        });

        assert_eq!(admitted, 4);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_submit_runs_task() {
        let pool = AdmissionPool::new(PoolConfig::default());
        assert_eq!(pool.workers(), 0);

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(42);
        })
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        assert_eq!(pool.workers(), 1);
    }

    #[tokio::test]
    async fn test_admitted_tasks_run_concurrently_up_to_max() {
        let pool = AdmissionPool::new(PoolConfig::default());
        let barrier = Arc::new(AsyncBarrier::new(5));

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            pool.submit(async move {
                barrier.wait().await;
            })
            .unwrap();
        }

        // Only completes if all four tasks are running at the same time
        tokio::time::timeout(Duration::from_secs(5), barrier.wait())
            .await
            .unwrap();
        assert_eq!(pool.workers(), 4);
    }

    #[tokio::test]
    async fn test_idle_worker_is_reused() {
        let pool = AdmissionPool::new(PoolConfig::default());

        for value in 0..3 {
            let (tx, rx) = oneshot::channel();
            pool.submit(async move {
                let _ = tx.send(value);
            })
            .unwrap();
            assert_eq!(rx.await.unwrap(), value);
            // Let the worker mark itself idle before the next submit
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        assert!(pool.workers() <= 2);
    }

    #[tokio::test]
    async fn test_saturated_pool_rejects_task() {
        let pool = AdmissionPool::new(config(1, 1, 1));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .unwrap();
        pool.submit(async {}).unwrap();

        let err = pool.submit(async {}).unwrap_err();
        assert_eq!(
            err,
            PoolError::Saturated {
                workers: 1,
                queued: 1
            }
        );

        let _ = release_tx.send(());
    }

    #[tokio::test]
    async fn test_readmission_with_small_queue_is_never_saturated() {
        let pool = AdmissionPool::new(config(1, 2, 1));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        for _ in 0..2 {
            let slot = pool.try_admit().unwrap();
            let mut release = release_rx.clone();
            pool.submit(async move {
                let _slot = slot;
                let _ = release.wait_for(|released| *released).await;
            })
            .unwrap();
        }
        assert_eq!(pool.workers(), 2);

        release_tx.send(true).unwrap();
        while pool.active() > 0 {
            tokio::task::yield_now().await;
        }

        // Slots are back but the workers may not have reported idle yet
        let mut done = Vec::new();
        for _ in 0..2 {
            let slot = pool.try_admit().unwrap();
            let (tx, rx) = oneshot::channel();
            pool.submit(async move {
                let _slot = slot;
                let _ = tx.send(());
            })
            .unwrap();
            done.push(rx);
        }

        for rx in done {
            tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(pool.workers() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_above_core_retire_when_idle() {
        let pool = AdmissionPool::new(PoolConfig::default());
        let barrier = Arc::new(AsyncBarrier::new(5));

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            pool.submit(async move {
                barrier.wait().await;
            })
            .unwrap();
        }
        barrier.wait().await;
        assert_eq!(pool.workers(), 4);

        tokio::time::sleep(Duration::from_secs(31)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.workers(), 2);
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let pool = AdmissionPool::new(config(1, 1, 1));

        pool.submit(async { panic!("boom") }).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(());
        })
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pool.workers(), 1);
    }
}
