use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use super::queue::Poll;
use super::{ExecutorShared, Job};
use crate::interrupt;

/// Lower bound on how long an idle worker parks before re-checking whether it
/// should retire.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Upper bound on a single idle park, so that a lowered maximum size or
/// keep-alive is observed without waiting out the previous keep-alive.
const MAX_IDLE_SLICE: Duration = Duration::from_millis(100);

/// # Worker Thread Implementation
///
/// One thread of a [`ThreadPoolExecutor`](super::ThreadPoolExecutor).
///
/// ## Core Algorithm
/// 1. Run the first job, if the worker was started with one
/// 2. Pull the next job from the work queue, waiting up to the keep-alive time
/// 3. Once idle for the live keep-alive, retire if the pool is above its core
///    size, unless that would strand queued jobs with no worker left
/// 4. Exit once the queue is closed and drained
///
/// ## Safety Considerations
/// - Panics inside jobs are caught and logged, the worker keeps running
/// - A stale interrupt is cleared before every job
pub(super) struct Worker {
    id: usize,
    executor: Arc<ExecutorShared>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("executor", &self.executor.name)
            .finish()
    }
}

impl Worker {
    pub(super) fn new(id: usize, executor: Arc<ExecutorShared>) -> Self {
        Self { id, executor }
    }

    /// Main worker loop. The worker's slot in the pool count must already be
    /// reserved; it is released when the loop ends.
    pub(super) fn run(self, first_job: Option<Job>) {
        trace!(executor = %self.executor.name, worker = self.id, "Worker started");

        let mut next = first_job;
        loop {
            let job = match next.take() {
                Some(job) => job,
                None => match self.next_job() {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run_job(job);
        }

        trace!(executor = %self.executor.name, worker = self.id, "Worker exiting");
        self.executor.try_terminate();
    }

    fn run_job(&self, job: Job) {
        interrupt::current().clear();
        self.executor.active_count.fetch_add(1, Ordering::SeqCst);

        if let Err(panic_error) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let message = if let Some(s) = panic_error.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic_error.downcast_ref::<String>() {
                s.clone()
            } else {
                "non-string panic payload".to_string()
            };
            error!(
                executor = %self.executor.name,
                worker = self.id,
                "Job panicked: {}", message
            );
        }

        self.executor.active_count.fetch_sub(1, Ordering::SeqCst);
        self.executor.completed_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Wait for the next job. `None` means this worker must exit; its slot in
    /// the pool count has been released by then.
    fn next_job(&self) -> Option<Job> {
        let executor = &self.executor;
        let mut idle_since = Instant::now();
        loop {
            // Shrunk below the live pool size.
            if executor.try_retire_above(executor.maximum_size.load(Ordering::SeqCst)) {
                trace!(executor = %executor.name, worker = self.id, "Surplus worker retiring");
                return None;
            }

            let keep_alive = executor.keep_alive().max(MIN_IDLE_WAIT);
            let idle = idle_since.elapsed();
            if idle >= keep_alive {
                if self.retire_idle() {
                    trace!(executor = %executor.name, worker = self.id, "Idle worker retiring");
                    return None;
                }
                idle_since = Instant::now();
                continue;
            }

            match executor.queue.poll((keep_alive - idle).min(MAX_IDLE_SLICE)) {
                Poll::Job(job) => return Some(job),
                Poll::TimedOut => {}
                Poll::Closed => {
                    executor.pool_size.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    /// Release this worker's slot if the pool is above its core size.
    ///
    /// A job offered after the last poll timed out may have seen this worker
    /// still counted and skipped starting one. The last worker therefore
    /// takes its slot back while the queue is non-empty.
    fn retire_idle(&self) -> bool {
        let executor = &self.executor;
        if !executor.try_retire_above(executor.core_size.load(Ordering::SeqCst)) {
            return false;
        }

        // Pairs with the fence after a successful offer in `execute_job`.
        atomic::fence(Ordering::SeqCst);
        if executor.queue.is_empty() {
            return true;
        }
        executor
            .pool_size
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
    }
}
