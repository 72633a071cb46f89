//! # Pool Scheduler
//!
//! Adapts an [`IsolationPool`] into a source of cancellable workers. A
//! [`Worker`] schedules tasks onto the pool's executor and can cancel them
//! all at once; each scheduled task is tracked by a [`ScheduledTask`] handle.
//!
//! ## Task State Machine
//! ```text
//! Idle ──start──> Running ──body returns──> Completed
//!   │                │
//!   └──cancel──> Cancelled <──cancel──┘
//! ```
//! - Cancelling an idle task guarantees its body never runs
//! - Cancelling a running task interrupts its thread if the scheduler's
//!   interrupt predicate returns true at that moment; the body is expected
//!   to notice (see [`crate::interrupt`]) and return early
//! - Terminal states never change and cancelling is idempotent
//!
//! ## Thread Safety
//! The task state is a single atomic driven by compare-and-swap from both the
//! submitting side and the worker thread executing the body.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Interrupted, ScheduleError};
use crate::executor::Job;
use crate::interrupt::{self, Interrupter, Monitor};
use crate::pool::IsolationPool;

/// Decides, at cancellation time, whether a running task's thread is
/// interrupted.
pub type InterruptPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const COMPLETED: u8 = 2;
const CANCELLED: u8 = 3;
/// A canceller is delivering the interrupt; reported as `Cancelled`.
const INTERRUPTING: u8 = 4;

/// Observable state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            IDLE => TaskState::Idle,
            RUNNING => TaskState::Running,
            COMPLETED => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

/// Hands out [`Worker`]s bound to one pool.
#[derive(Clone)]
pub struct PoolScheduler {
    pool: Arc<IsolationPool>,
    should_interrupt: InterruptPredicate,
}

impl fmt::Debug for PoolScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolScheduler")
            .field("pool", self.pool.key())
            .finish()
    }
}

impl PoolScheduler {
    pub(crate) fn new(pool: Arc<IsolationPool>, should_interrupt: InterruptPredicate) -> Self {
        Self {
            pool,
            should_interrupt,
        }
    }

    pub fn pool(&self) -> &Arc<IsolationPool> {
        &self.pool
    }

    pub fn create_worker(&self) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            pool: self.pool.clone(),
            should_interrupt: self.should_interrupt.clone(),
            unsubscribed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Schedules tasks onto a pool and cancels them on
/// [`unsubscribe`](Worker::unsubscribe).
pub struct Worker {
    id: Uuid,
    pool: Arc<IsolationPool>,
    should_interrupt: InterruptPredicate,
    unsubscribed: AtomicBool,
    /// Tasks that may still need cancelling.
    tasks: Mutex<Vec<Weak<TaskCell>>>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("pool", self.pool.key())
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}

impl Worker {
    /// Submit `task` to the pool's executor.
    ///
    /// Refused when this worker is unsubscribed, when the pool's queue is at
    /// its rejection threshold, or when the executor itself rejects the task.
    /// Both rejections are reported to the pool.
    pub fn schedule<F>(&self, task: F) -> Result<ScheduledTask, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_unsubscribed() {
            return Err(ScheduleError::Unsubscribed);
        }

        let pool = &self.pool;
        if !pool.is_queue_space_available() {
            pool.mark_thread_rejection();
            debug!(pool = %pool.key(), worker = %self.id, "Queue at rejection threshold");
            return Err(ScheduleError::Rejected {
                pool: pool.key().clone(),
                reason: "queue size is at rejection threshold".to_string(),
            });
        }

        let cell = Arc::new(TaskCell::new(self.should_interrupt.clone()));
        {
            let mut tasks = self.tasks.lock();
            // Checked under the lock so unsubscribe cannot miss this task.
            if self.is_unsubscribed() {
                return Err(ScheduleError::Unsubscribed);
            }
            tasks.retain(|task| task.upgrade().is_some_and(|task| !task.is_finished()));
            tasks.push(Arc::downgrade(&cell));
        }

        let body = pool.strategy().wrap_task(Box::new(task));
        let run_cell = cell.clone();
        let run_pool = pool.clone();
        let submitted = pool
            .executor()
            .execute_job(Box::new(move || run_cell.run(body, &run_pool)));

        if let Err(rejected) = submitted {
            pool.mark_thread_rejection();
            cell.abandon();
            debug!(pool = %pool.key(), worker = %self.id, error = %rejected, "Executor rejected task");
            return Err(ScheduleError::from((pool.key().clone(), rejected)));
        }

        Ok(ScheduledTask { cell })
    }

    /// Delayed scheduling is not supported by isolation pools.
    pub fn schedule_after<F>(&self, _delay: Duration, _task: F) -> Result<ScheduledTask, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        Err(ScheduleError::DelayedSchedulingUnsupported)
    }

    /// Cancel every task scheduled through this worker and refuse new ones.
    /// Calling it again has no further effect.
    pub fn unsubscribe(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock();
            if self.unsubscribed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *tasks)
        };

        debug!(pool = %self.pool.key(), worker = %self.id, tasks = tasks.len(), "Worker unsubscribed");
        for task in tasks.iter().filter_map(Weak::upgrade) {
            task.cancel();
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }
}

/// Handle to one scheduled task.
#[derive(Clone)]
pub struct ScheduledTask {
    cell: Arc<TaskCell>,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("state", &self.state())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl ScheduledTask {
    /// Cancel the task. See the module docs for the effect in each state.
    pub fn cancel(&self) {
        self.cell.cancel();
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the body has stopped running, or will never run.
    ///
    /// A task cancelled while running is terminal straight away but only
    /// finished once its body returns.
    pub fn is_finished(&self) -> bool {
        self.cell.is_finished()
    }

    /// Block until the task is finished or `timeout` elapses. Returns
    /// `Ok(true)` if it finished.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, Interrupted> {
        interrupt::wait_until(&self.cell.finished, Some(timeout), |finished| *finished)
    }

    /// Resolve once the task is finished.
    pub async fn finished(&self) {
        let mut rx = self.cell.finished_tx.subscribe();
        // The sender lives in the cell we hold, so this cannot fail.
        let _ = rx.wait_for(|finished| *finished).await;
    }
}

struct TaskCell {
    state: AtomicU8,
    /// Interrupter of the thread running the body, while it runs.
    runner: Mutex<Option<Interrupter>>,
    should_interrupt: InterruptPredicate,
    finished: Arc<Monitor<bool>>,
    finished_tx: watch::Sender<bool>,
}

impl TaskCell {
    fn new(should_interrupt: InterruptPredicate) -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(IDLE),
            runner: Mutex::new(None),
            should_interrupt,
            finished: Arc::new(Monitor::new(false)),
            finished_tx,
        }
    }

    fn state(&self) -> TaskState {
        TaskState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn is_finished(&self) -> bool {
        *self.finished.lock()
    }

    /// Executed on the worker thread.
    fn run(&self, body: Job, pool: &IsolationPool) {
        // Published before the state flips so a canceller that sees RUNNING
        // also sees the interrupter.
        *self.runner.lock() = Some(interrupt::current());
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Cancelled before it started.
            self.runner.lock().take();
            return;
        }

        pool.mark_thread_execution();
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        pool.mark_thread_completion();
        self.runner.lock().take();

        if self
            .state
            .compare_exchange(RUNNING, COMPLETED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Cancelled while running. Wait out an interrupt in flight, then
            // make sure it does not leak into the next job on this thread.
            while self.state.load(Ordering::SeqCst) == INTERRUPTING {
                thread::yield_now();
            }
            interrupt::current().clear();
        }
        self.finish();

        if let Err(payload) = outcome {
            panic::resume_unwind(payload);
        }
    }

    fn cancel(&self) {
        loop {
            match self.state.load(Ordering::SeqCst) {
                IDLE => {
                    if self
                        .state
                        .compare_exchange(IDLE, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        self.finish();
                        return;
                    }
                }
                RUNNING => {
                    if (self.should_interrupt)() {
                        if self
                            .state
                            .compare_exchange(RUNNING, INTERRUPTING, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            let runner = self.runner.lock().clone();
                            if let Some(runner) = runner {
                                runner.interrupt();
                            }
                            self.state.store(CANCELLED, Ordering::SeqCst);
                            return;
                        }
                    } else if self
                        .state
                        .compare_exchange(RUNNING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// The executor refused the task; it will never run.
    fn abandon(&self) {
        self.state.store(CANCELLED, Ordering::SeqCst);
        self.finish();
    }

    fn finish(&self) {
        {
            let mut finished = self.finished.lock();
            *finished = true;
            self.finished.notify_all();
        }
        self.finished_tx.send_replace(true);
    }
}
