//! # Bounded Thread-Pool Executor
//!
//! The worker pool that backs every isolation pool. Executors are created by a
//! [`ConcurrencyStrategy`](crate::strategy::ConcurrencyStrategy) and shared by
//! reference; only the owning isolation pool resizes them.
//!
//! ## Admission
//! A submitted job is handled by the first rule that applies:
//! 1. Fewer live workers than the core size: start a new worker for it
//! 2. The work queue accepts it
//! 3. Fewer live workers than the maximum size: start a new worker for it
//! 4. Otherwise it is rejected
//!
//! ## Resizing
//! Core size, maximum size and keep-alive are live values. Growing the core
//! size starts workers for jobs already queued; shrinking lets surplus workers
//! retire the next time they are idle.
//!
//! ## Shutdown
//! [`shutdown`](ThreadPoolExecutor::shutdown) stops admission but lets queued
//! jobs finish. The executor is terminated once the last worker has exited.

mod queue;
mod worker;

use std::fmt;
use std::io;
use std::sync::atomic::{self, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Interrupted, RejectedExecution};
use crate::interrupt::{self, Monitor};
use crate::logging;
use queue::WorkQueue;
use worker::Worker;

/// A unit of work run by an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Creates the threads an executor runs its workers on.
///
/// Hosts substitute their own factory to control thread naming, stack size or
/// context propagation.
pub trait ThreadFactory: fmt::Debug + Send + Sync {
    /// Start a detached thread running `body`.
    fn spawn(&self, body: Job) -> io::Result<()>;
}

/// Default [`ThreadFactory`]: threads are named `<prefix>-<n>` and inherit the
/// tracing dispatcher of the thread that created the factory.
pub struct NamedThreadFactory {
    prefix: String,
    counter: AtomicUsize,
    dispatch: tracing::Dispatch,
}

impl fmt::Debug for NamedThreadFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedThreadFactory")
            .field("prefix", &self.prefix)
            .field("created", &self.counter.load(Ordering::Relaxed))
            .finish()
    }
}

impl NamedThreadFactory {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicUsize::new(0),
            dispatch: logging::current_subscriber(),
        }
    }
}

impl ThreadFactory for NamedThreadFactory {
    fn spawn(&self, body: Job) -> io::Result<()> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let dispatch = self.dispatch.clone();
        thread::Builder::new()
            .name(format!("{}-{}", self.prefix, n))
            .spawn(move || {
                let _guard = tracing::dispatcher::set_default(&dispatch);
                body();
            })
            .map(|_| ())
    }
}

/// Initial sizing of a [`ThreadPoolExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Name used in logs and rejection errors.
    pub name: String,
    pub core_size: usize,
    pub maximum_size: usize,
    pub keep_alive: Duration,
    /// `None` selects a direct hand-off instead of a bounded queue.
    pub queue_capacity: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "bulkhead".to_string(),
            core_size: 10,
            maximum_size: 10,
            keep_alive: Duration::from_secs(60),
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Shutdown,
    Terminated,
}

/// State shared between the executor handle and its worker threads.
pub(crate) struct ExecutorShared {
    name: String,
    core_size: AtomicUsize,
    maximum_size: AtomicUsize,
    keep_alive_ms: AtomicU64,
    queue: WorkQueue,
    pool_size: AtomicUsize,
    active_count: AtomicUsize,
    largest_pool_size: AtomicUsize,
    completed_tasks: AtomicU64,
    next_worker_id: AtomicUsize,
    run_state: Arc<Monitor<RunState>>,
    resize_lock: Mutex<()>,
    thread_factory: Arc<dyn ThreadFactory>,
}

impl ExecutorShared {
    fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms.load(Ordering::SeqCst))
    }

    /// Release one worker slot if the pool is larger than `limit`.
    fn try_retire_above(&self, limit: usize) -> bool {
        let mut current = self.pool_size.load(Ordering::SeqCst);
        while current > limit {
            match self.pool_size.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Reserve a worker slot bounded by the core or maximum size and start a
    /// worker thread in it.
    fn add_worker(self: &Arc<Self>, first_job: Option<Job>, core: bool) -> Result<(), Option<Job>> {
        let limit = if core {
            self.core_size.load(Ordering::SeqCst)
        } else {
            self.maximum_size.load(Ordering::SeqCst)
        };

        let mut current = self.pool_size.load(Ordering::SeqCst);
        loop {
            if current >= limit {
                return Err(first_job);
            }
            match self.pool_size.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.largest_pool_size.fetch_max(current + 1, Ordering::SeqCst);

        // The job travels through a slot so it can be recovered if the thread
        // never starts.
        let slot = Arc::new(Mutex::new(first_job));
        let worker = Worker::new(self.next_worker_id.fetch_add(1, Ordering::SeqCst), self.clone());
        let body_slot = slot.clone();
        let spawned = self.thread_factory.spawn(Box::new(move || {
            let first = body_slot.lock().take();
            worker.run(first);
        }));

        match spawned {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(executor = %self.name, error = %e, "Failed to start worker thread");
                self.pool_size.fetch_sub(1, Ordering::SeqCst);
                self.try_terminate();
                let recovered = slot.lock().take();
                Err(recovered)
            }
        }
    }

    fn try_terminate(&self) {
        let mut state = self.run_state.lock();
        if *state == RunState::Shutdown
            && self.pool_size.load(Ordering::SeqCst) == 0
            && self.queue.is_empty()
        {
            *state = RunState::Terminated;
            self.run_state.notify_all();
            debug!(executor = %self.name, "Executor terminated");
        }
    }
}

/// A bounded, resizable pool of worker threads.
pub struct ThreadPoolExecutor {
    shared: Arc<ExecutorShared>,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.shared.name)
            .field("core_size", &self.core_size())
            .field("maximum_size", &self.maximum_size())
            .field("pool_size", &self.pool_size())
            .field("active_count", &self.active_count())
            .field("queue", &self.shared.queue)
            .field("state", &*self.shared.run_state.lock())
            .finish()
    }
}

impl ThreadPoolExecutor {
    /// Create an executor whose threads come from `thread_factory`. No thread
    /// is started until the first job arrives.
    pub fn new(config: ExecutorConfig, thread_factory: Arc<dyn ThreadFactory>) -> Self {
        let maximum_size = config.maximum_size.max(config.core_size).max(1);
        debug!(
            executor = %config.name,
            core_size = config.core_size,
            maximum_size,
            queue_capacity = ?config.queue_capacity,
            "Creating executor"
        );
        Self {
            shared: Arc::new(ExecutorShared {
                core_size: AtomicUsize::new(config.core_size),
                maximum_size: AtomicUsize::new(maximum_size),
                keep_alive_ms: AtomicU64::new(duration_millis(config.keep_alive)),
                queue: WorkQueue::new(config.queue_capacity),
                pool_size: AtomicUsize::new(0),
                active_count: AtomicUsize::new(0),
                largest_pool_size: AtomicUsize::new(0),
                completed_tasks: AtomicU64::new(0),
                next_worker_id: AtomicUsize::new(0),
                run_state: Arc::new(Monitor::new(RunState::Running)),
                resize_lock: Mutex::new(()),
                thread_factory,
                name: config.name,
            }),
        }
    }

    /// Create an executor using a [`NamedThreadFactory`] prefixed with the
    /// executor's name.
    pub fn with_config(config: ExecutorConfig) -> Self {
        let factory = Arc::new(NamedThreadFactory::new(config.name.clone()));
        Self::new(config, factory)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submit a closure for execution.
    pub fn execute<F>(&self, task: F) -> Result<(), RejectedExecution>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_job(Box::new(task))
    }

    /// Submit a boxed job for execution.
    pub fn execute_job(&self, job: Job) -> Result<(), RejectedExecution> {
        let shared = &self.shared;
        let admission = shared.queue.admission();
        let Some(sender) = admission.as_ref() else {
            return Err(RejectedExecution::Shutdown(shared.name.clone()));
        };

        let job = match shared.add_worker(Some(job), true) {
            Ok(()) => return Ok(()),
            Err(Some(job)) => job,
            Err(None) => return Err(self.saturated()),
        };

        let job = match WorkQueue::offer(sender, job) {
            Ok(()) => {
                // Every worker may have retired between the checks. Pairs
                // with the fence in `Worker::retire_idle`.
                atomic::fence(Ordering::SeqCst);
                if shared.pool_size.load(Ordering::SeqCst) == 0 {
                    let _ = shared.add_worker(None, false);
                }
                return Ok(());
            }
            Err(job) => job,
        };

        match shared.add_worker(Some(job), false) {
            Ok(()) => Ok(()),
            Err(_) => Err(self.saturated()),
        }
    }

    fn saturated(&self) -> RejectedExecution {
        RejectedExecution::Saturated {
            name: self.shared.name.clone(),
            pool_size: self.pool_size(),
            queued: self.queue_len(),
        }
    }

    pub fn core_size(&self) -> usize {
        self.shared.core_size.load(Ordering::SeqCst)
    }

    pub fn maximum_size(&self) -> usize {
        self.shared.maximum_size.load(Ordering::SeqCst)
    }

    /// Apply new core and maximum sizes together.
    ///
    /// The applied maximum is never below the core size nor below one.
    pub fn set_pool_sizes(&self, core_size: usize, maximum_size: usize) {
        let shared = &self.shared;
        let _resize = shared.resize_lock.lock();
        let maximum_size = maximum_size.max(core_size).max(1);
        let previous_core = shared.core_size.load(Ordering::SeqCst);

        // Raise the ceiling before the floor so maximum >= core at every step.
        if maximum_size >= shared.maximum_size.load(Ordering::SeqCst) {
            shared.maximum_size.store(maximum_size, Ordering::SeqCst);
            shared.core_size.store(core_size, Ordering::SeqCst);
        } else {
            shared.core_size.store(core_size, Ordering::SeqCst);
            shared.maximum_size.store(maximum_size, Ordering::SeqCst);
        }

        if core_size > previous_core {
            let admission = shared.queue.admission();
            if admission.is_some() {
                let wanted = (core_size - previous_core).min(shared.queue.len());
                for _ in 0..wanted {
                    if shared.add_worker(None, true).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Change the core size, raising the maximum along with it if needed.
    pub fn set_core_size(&self, core_size: usize) {
        self.set_pool_sizes(core_size, self.maximum_size());
    }

    /// Change the maximum size. Clamped to the current core size.
    pub fn set_maximum_size(&self, maximum_size: usize) {
        self.set_pool_sizes(self.core_size(), maximum_size);
    }

    pub fn keep_alive(&self) -> Duration {
        self.shared.keep_alive()
    }

    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.shared
            .keep_alive_ms
            .store(duration_millis(keep_alive), Ordering::SeqCst);
    }

    /// Number of queued jobs, a point-in-time value.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// `None` when jobs are handed off directly instead of queued.
    pub fn queue_capacity(&self) -> Option<usize> {
        self.shared.queue.capacity()
    }

    /// Number of live worker threads.
    pub fn pool_size(&self) -> usize {
        self.shared.pool_size.load(Ordering::SeqCst)
    }

    /// Number of workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.shared.active_count.load(Ordering::SeqCst)
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.largest_pool_size.load(Ordering::SeqCst)
    }

    pub fn completed_task_count(&self) -> u64 {
        self.shared.completed_tasks.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs. Queued jobs still run. Does not wait.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let closed_now = shared.queue.close();
        {
            let mut state = shared.run_state.lock();
            if *state == RunState::Running {
                *state = RunState::Shutdown;
            }
        }
        if closed_now {
            info!(
                executor = %shared.name,
                pool_size = self.pool_size(),
                queued = self.queue_len(),
                "Executor shutting down"
            );
        }
        shared.try_terminate();
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shared.run_state.lock() != RunState::Running
    }

    pub fn is_terminated(&self) -> bool {
        *self.shared.run_state.lock() == RunState::Terminated
    }

    /// Block until the executor has terminated or `timeout` elapses.
    ///
    /// Returns `Ok(true)` once terminated, `Ok(false)` on timeout and
    /// `Err(Interrupted)` if the calling thread is interrupted while waiting.
    pub fn await_termination(&self, timeout: Duration) -> Result<bool, Interrupted> {
        interrupt::wait_until(&self.shared.run_state, Some(timeout), |state| {
            *state == RunState::Terminated
        })
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    fn config(name: &str, core: usize, max: usize, queue: Option<usize>) -> ExecutorConfig {
        ExecutorConfig {
            name: name.to_string(),
            core_size: core,
            maximum_size: max,
            keep_alive: Duration::from_secs(60),
            queue_capacity: queue,
        }
    }

    #[test]
    fn test_runs_submitted_jobs() {
        let executor = ThreadPoolExecutor::with_config(config("exec-run", 2, 2, Some(10)));
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            executor.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let mut seen: Vec<i32> = (0..5).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(executor.pool_size() <= 2);
        assert_eq!(executor.largest_pool_size(), 2);
    }

    #[test]
    fn test_rejects_when_saturated() {
        let executor = ThreadPoolExecutor::with_config(config("exec-saturated", 1, 1, Some(1)));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        executor
            .execute(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Fills the single queue slot.
        executor.execute(|| {}).unwrap();
        let rejected = executor.execute(|| {});
        assert!(matches!(rejected, Err(RejectedExecution::Saturated { .. })));

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_grows_to_maximum_when_queue_full() {
        let executor = ThreadPoolExecutor::with_config(config("exec-grow", 1, 3, Some(1)));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        for _ in 0..4 {
            let release_rx = release_rx.clone();
            executor
                .execute(move || {
                    let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                })
                .unwrap();
        }
        assert_eq!(executor.pool_size(), 3);
        assert!(executor.execute(|| {}).is_err());

        for _ in 0..4 {
            let _ = release_tx.send(());
        }
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let executor = ThreadPoolExecutor::with_config(config("exec-panic", 1, 1, Some(4)));
        executor.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        executor.execute(move || tx.send(42).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn test_set_pool_sizes_never_below_core() {
        let executor = ThreadPoolExecutor::with_config(config("exec-resize", 2, 2, None));
        executor.set_pool_sizes(10, 5);
        assert_eq!(executor.core_size(), 10);
        assert_eq!(executor.maximum_size(), 10);

        executor.set_pool_sizes(3, 6);
        assert_eq!(executor.core_size(), 3);
        assert_eq!(executor.maximum_size(), 6);

        executor.set_core_size(8);
        assert_eq!(executor.maximum_size(), 8);
        executor.set_maximum_size(2);
        assert_eq!(executor.core_size(), 8);
        assert_eq!(executor.maximum_size(), 8);
    }

    #[test]
    fn test_shutdown_rejects_and_terminates() {
        let executor = ThreadPoolExecutor::with_config(config("exec-shutdown", 1, 1, Some(4)));
        let (tx, rx) = mpsc::channel();
        executor.execute(move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        executor.shutdown();
        assert!(executor.is_shutdown());
        assert!(matches!(executor.execute(|| {}), Err(RejectedExecution::Shutdown(_))));
        assert_eq!(executor.await_termination(Duration::from_secs(5)), Ok(true));
        assert!(executor.is_terminated());
    }

    #[test]
    fn test_shutdown_without_workers_terminates_immediately() {
        let executor = ThreadPoolExecutor::with_config(config("exec-idle", 1, 1, None));
        executor.shutdown();
        assert!(executor.is_terminated());
    }

    #[test]
    fn test_await_termination_times_out_while_busy() {
        let executor = ThreadPoolExecutor::with_config(config("exec-busy", 1, 1, None));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        executor
            .execute(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        executor.shutdown();

        let start = Instant::now();
        assert_eq!(executor.await_termination(Duration::from_millis(50)), Ok(false));
        assert!(start.elapsed() >= Duration::from_millis(50));

        release_tx.send(()).unwrap();
        assert_eq!(executor.await_termination(Duration::from_secs(5)), Ok(true));
    }

    fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    /// Grow `executor` (core 1, max 3, one queue slot) to three workers and
    /// let them all go idle.
    fn grow_to_three_idle_workers(executor: &ThreadPoolExecutor) {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));
        for _ in 0..4 {
            let release_rx = release_rx.clone();
            executor
                .execute(move || {
                    let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
                })
                .unwrap();
        }
        assert_eq!(executor.pool_size(), 3);
        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        assert!(eventually(Duration::from_secs(5), || {
            executor.completed_task_count() == 4
        }));
    }

    #[test]
    fn test_last_idle_worker_does_not_strand_queued_job() {
        let mut cfg = config("exec-no-core", 0, 1, Some(10));
        cfg.keep_alive = Duration::ZERO;
        let executor = ThreadPoolExecutor::with_config(cfg);
        let (tx, rx) = mpsc::channel();

        // Submissions land at varying offsets around the idle worker's
        // retirement point.
        for i in 0..300u64 {
            thread::sleep(Duration::from_micros(8_000 + (i % 40) * 100));
            let tx = tx.clone();
            executor.execute(move || tx.send(i).unwrap()).unwrap();
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(2)),
                Ok(i),
                "job {} stranded (pool size {}, queued {})",
                i,
                executor.pool_size(),
                executor.queue_len()
            );
        }

        executor.shutdown();
        assert_eq!(executor.await_termination(Duration::from_secs(5)), Ok(true));
    }

    #[test]
    fn test_lowered_maximum_retires_idle_workers_promptly() {
        let executor = ThreadPoolExecutor::with_config(config("exec-shrink-max", 1, 3, Some(1)));
        grow_to_three_idle_workers(&executor);

        executor.set_pool_sizes(1, 1);
        assert!(eventually(Duration::from_secs(1), || executor.pool_size() == 1));
    }

    #[test]
    fn test_lowered_keep_alive_retires_idle_workers_promptly() {
        let executor = ThreadPoolExecutor::with_config(config("exec-shrink-keep-alive", 1, 3, Some(1)));
        grow_to_three_idle_workers(&executor);
        assert_eq!(executor.pool_size(), 3);

        executor.set_keep_alive(Duration::ZERO);
        assert!(eventually(Duration::from_secs(1), || executor.pool_size() == 1));
    }
}
