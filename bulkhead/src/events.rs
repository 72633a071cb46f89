//! # Pool Events
//!
//! Signals an isolation pool reports outward to health tracking and metrics
//! collaborators. This crate only counts them; publishing is up to the
//! [`EventNotifier`] a registry is configured with.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::key::PoolKey;

/// Lifecycle signals of work passing through a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolEvent {
    /// A task body started running on a worker.
    ThreadExecution,
    /// A task body finished, normally or not.
    ThreadCompletion,
    /// A task was refused admission.
    ThreadRejection,
}

/// Receiver of pool events. Called on the thread where the event happened,
/// so implementations must be cheap and must not block.
pub trait EventNotifier: fmt::Debug + Send + Sync {
    fn mark_event(&self, key: &PoolKey, event: PoolEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventNotifier;

impl EventNotifier for NoopEventNotifier {
    fn mark_event(&self, _key: &PoolKey, _event: PoolEvent) {}
}

/// Cumulative counters of one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    executed: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    concurrent_executions: AtomicUsize,
    max_concurrent_executions: AtomicUsize,
}

impl PoolMetrics {
    pub(crate) fn record(&self, event: PoolEvent) {
        match event {
            PoolEvent::ThreadExecution => {
                self.executed.fetch_add(1, Ordering::Relaxed);
                let now = self.concurrent_executions.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_concurrent_executions.fetch_max(now, Ordering::Relaxed);
            }
            PoolEvent::ThreadCompletion => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                // Saturate rather than wrap on unpaired completions.
                let _ = self.concurrent_executions.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |n| n.checked_sub(1),
                );
            }
            PoolEvent::ThreadRejection => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Task bodies currently running.
    pub fn concurrent_execution_count(&self) -> usize {
        self.concurrent_executions.load(Ordering::SeqCst)
    }

    /// Highest value [`concurrent_execution_count`](Self::concurrent_execution_count)
    /// has reached.
    pub fn max_concurrent_execution_count(&self) -> usize {
        self.max_concurrent_executions.load(Ordering::Relaxed)
    }
}
