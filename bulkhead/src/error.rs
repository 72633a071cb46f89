use thiserror::Error;

use crate::key::PoolKey;

/// Raised by an interruptible wait when the waiting thread was interrupted.
///
/// The interrupt flag has already been consumed when this is returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Thread was interrupted while waiting")]
pub struct Interrupted;

/// Errors returned by an executor that refuses a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectedExecution {
    #[error("Executor {0} has been shut down")]
    Shutdown(String),
    #[error("Executor {name} is saturated (pool size: {pool_size}, queued: {queued})")]
    Saturated {
        name: String,
        pool_size: usize,
        queued: usize,
    },
}

/// Errors related to scheduling work through a pool's scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Worker has been unsubscribed")]
    Unsubscribed,
    #[error("Rejected task on pool {pool}: {reason}")]
    Rejected { pool: PoolKey, reason: String },
    #[error("Delayed scheduling is not supported")]
    DelayedSchedulingUnsupported,
}

impl From<(PoolKey, RejectedExecution)> for ScheduleError {
    fn from((pool, err): (PoolKey, RejectedExecution)) -> Self {
        ScheduleError::Rejected {
            pool,
            reason: err.to_string(),
        }
    }
}

/// Errors raised by the bounded-wait shutdown of all pools.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    /// Fatal: the calling thread was interrupted while waiting for `pool` to
    /// terminate. Pools may not be correctly shut down or cleared.
    #[error("Interrupted while waiting for pool {pool} to terminate. Pools may not be correctly shutdown or cleared")]
    Interrupted { pool: PoolKey },
}

impl ShutdownError {
    /// Whether the affected pools must be treated as possibly still running.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownError::Interrupted { .. })
    }
}

/// Errors related to pool lookup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool not found: {0}")]
    NotFound(PoolKey),
}
