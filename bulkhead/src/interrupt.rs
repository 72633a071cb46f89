//! # Cooperative Thread Interruption
//!
//! Rust threads cannot be pre-empted or interrupted from the outside, so this
//! module gives every thread an interrupt flag that other threads can raise
//! through an [`Interrupter`] handle.
//!
//! ## Key Concepts
//! - Advisory: raising the flag never stops a thread by itself. Code running
//!   on the thread must poll [`is_interrupted`] / [`interrupted`] or block in
//!   one of this module's interruptible waits ([`sleep`]).
//! - Wake-up: a thread parked in an interruptible wait is woken as soon as its
//!   flag is raised, and the wait returns [`Interrupted`] after consuming the
//!   flag.
//! - Worker threads of a [`ThreadPoolExecutor`](crate::executor::ThreadPoolExecutor)
//!   clear their flag before each job so an interrupt aimed at one task never
//!   leaks into the next one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Interrupted;

thread_local! {
    static CURRENT: Interrupter = Interrupter::new();
}

/// Something a parked thread is waiting on, able to wake it up.
pub(crate) trait Blocker: Send + Sync {
    fn wake(&self);
}

/// A mutex paired with a condition variable that interruptible waits can
/// park on.
pub(crate) struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    pub(crate) fn notify_all(&self) {
        self.cond.notify_all();
    }
}

impl<T: Send> Blocker for Monitor<T> {
    fn wake(&self) {
        // Taking the lock orders the wake-up after the waiter's flag check.
        let _guard = self.state.lock();
        self.cond.notify_all();
    }
}

struct InterruptState {
    interrupted: AtomicBool,
    blocker: Mutex<Option<Arc<dyn Blocker>>>,
}

/// Handle to one thread's interrupt flag.
///
/// Cloning the handle is cheap; all clones refer to the same thread.
#[derive(Clone)]
pub struct Interrupter {
    inner: Arc<InterruptState>,
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl Interrupter {
    fn new() -> Self {
        Self {
            inner: Arc::new(InterruptState {
                interrupted: AtomicBool::new(false),
                blocker: Mutex::new(None),
            }),
        }
    }

    /// The interrupter of the calling thread.
    pub fn current() -> Self {
        CURRENT
            .try_with(Interrupter::clone)
            .unwrap_or_else(|_| Interrupter::new())
    }

    /// Raise the interrupt flag and wake the thread if it is parked in an
    /// interruptible wait.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let blocker = self.inner.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.wake();
        }
    }

    /// Whether the flag is raised. Does not clear it.
    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised.
    pub fn clear(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::SeqCst)
    }

    /// Whether two handles refer to the same thread.
    pub fn same_thread(&self, other: &Interrupter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn park_on(&self, blocker: Arc<dyn Blocker>) -> ParkRegistration<'_> {
        *self.inner.blocker.lock() = Some(blocker);
        ParkRegistration { state: &self.inner }
    }
}

struct ParkRegistration<'a> {
    state: &'a InterruptState,
}

impl Drop for ParkRegistration<'_> {
    fn drop(&mut self) {
        self.state.blocker.lock().take();
    }
}

/// The calling thread's interrupter.
pub fn current() -> Interrupter {
    Interrupter::current()
}

/// Whether the calling thread has been interrupted. Does not clear the flag.
pub fn is_interrupted() -> bool {
    current().is_interrupted()
}

/// Test-and-clear the calling thread's interrupt flag.
pub fn interrupted() -> bool {
    current().clear()
}

/// Sleep for `duration`, returning early with [`Interrupted`] if the calling
/// thread is interrupted before or during the sleep.
pub fn sleep(duration: Duration) -> Result<(), Interrupted> {
    let monitor = Arc::new(Monitor::new(()));
    wait_until(&monitor, Some(duration), |_| false).map(|_| ())
}

/// Park the calling thread on `monitor` until `done` holds, the timeout
/// elapses or the thread is interrupted.
///
/// Returns `Ok(true)` when `done` held, `Ok(false)` on timeout. `None` waits
/// without a deadline. `done` is evaluated before the interrupt flag, so a
/// condition that already holds wins over a pending interrupt.
pub(crate) fn wait_until<T, F>(
    monitor: &Arc<Monitor<T>>,
    timeout: Option<Duration>,
    mut done: F,
) -> Result<bool, Interrupted>
where
    T: Send + 'static,
    F: FnMut(&T) -> bool,
{
    let current = current();
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let _registration = current.park_on(monitor.clone());

    let mut guard = monitor.lock();
    loop {
        if done(&guard) {
            return Ok(true);
        }
        if current.clear() {
            return Err(Interrupted);
        }
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                monitor.cond.wait_for(&mut guard, deadline - now);
            }
            // No timeout, or the deadline overflowed.
            None => monitor.cond.wait(&mut guard),
        }
    }
}
