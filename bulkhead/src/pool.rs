//! # Isolation Pool
//!
//! Bulkheads one named class of work behind a bounded, resizable executor.
//!
//! ## Key Concepts
//! - Shared executor: every wrapper created for a key resolves the same
//!   executor through the [`ExecutorRegistry`]; wrappers never own it
//! - Touch: each time the executor or a scheduler is handed out, the live
//!   properties are re-applied to the running executor
//! - Backpressure: [`is_queue_space_available`](IsolationPool::is_queue_space_available)
//!   compares the live queue length against a threshold that can be tuned
//!   at runtime. The answer is advisory; a racing submission can still be
//!   rejected by the executor
//!
//! ## Thread Safety
//! All operations take `&self` and may be called from any thread.

use std::fmt;
use std::sync::Arc;

use tracing::error;

use crate::events::{EventNotifier, NoopEventNotifier, PoolEvent, PoolMetrics};
use crate::executor::ThreadPoolExecutor;
use crate::key::PoolKey;
use crate::properties::PoolProperties;
use crate::registry::ExecutorRegistry;
use crate::scheduler::PoolScheduler;
use crate::strategy::{self, ConcurrencyStrategy};

/// Wrapper exposing one pool's executor, scheduler and admission signals.
pub struct IsolationPool {
    key: PoolKey,
    properties: Arc<dyn PoolProperties>,
    executor: Arc<ThreadPoolExecutor>,
    /// Queue capacity at creation. The queue itself cannot change size, so
    /// this is deliberately not re-read from the properties.
    queue_size: i32,
    metrics: PoolMetrics,
    notifier: Arc<dyn EventNotifier>,
    strategy: Arc<dyn ConcurrencyStrategy>,
}

impl fmt::Debug for IsolationPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationPool")
            .field("key", &self.key)
            .field("queue_size", &self.queue_size)
            .field("executor", &self.executor)
            .finish()
    }
}

impl IsolationPool {
    /// Create a wrapper for `key`, resolving (or building) its executor
    /// through `executors`.
    pub fn new(
        key: PoolKey,
        properties: Arc<dyn PoolProperties>,
        executors: &ExecutorRegistry,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        let queue_size = properties.max_queue_size();
        let executor = executors.resolve(&key, properties.as_ref());
        Self {
            key,
            properties,
            executor,
            queue_size,
            metrics: PoolMetrics::default(),
            notifier,
            strategy: executors.strategy().clone(),
        }
    }

    /// Like [`new`](Self::new) with events discarded.
    pub fn without_notifier(key: PoolKey, properties: Arc<dyn PoolProperties>, executors: &ExecutorRegistry) -> Self {
        Self::new(key, properties, executors, Arc::new(NoopEventNotifier))
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn properties(&self) -> &Arc<dyn PoolProperties> {
        &self.properties
    }

    /// Queue capacity fixed when this pool was created.
    pub fn queue_size(&self) -> i32 {
        self.queue_size
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub(crate) fn strategy(&self) -> &Arc<dyn ConcurrencyStrategy> {
        &self.strategy
    }

    /// The shared executor, after re-applying the live size and keep-alive
    /// properties to it.
    pub fn executor(&self) -> &Arc<ThreadPoolExecutor> {
        self.touch_config();
        &self.executor
    }

    /// The executor without reconciling properties. Used by shutdown paths,
    /// which must not resize an executor they are tearing down.
    pub(crate) fn raw_executor(&self) -> &Arc<ThreadPoolExecutor> {
        &self.executor
    }

    /// A scheduler that interrupts running tasks when they are cancelled.
    pub fn scheduler(self: &Arc<Self>) -> PoolScheduler {
        self.scheduler_with(|| true)
    }

    /// A scheduler whose cancellations interrupt running tasks only when
    /// `should_interrupt` returns true at cancellation time.
    pub fn scheduler_with<F>(self: &Arc<Self>, should_interrupt: F) -> PoolScheduler
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.touch_config();
        PoolScheduler::new(self.clone(), Arc::new(should_interrupt))
    }

    /// Signal that a task body started on a worker thread.
    pub fn mark_thread_execution(&self) {
        self.mark(PoolEvent::ThreadExecution);
    }

    /// Signal that a task body finished.
    pub fn mark_thread_completion(&self) {
        self.mark(PoolEvent::ThreadCompletion);
    }

    /// Signal that a task was refused admission.
    pub fn mark_thread_rejection(&self) {
        self.mark(PoolEvent::ThreadRejection);
    }

    fn mark(&self, event: PoolEvent) {
        self.metrics.record(event);
        self.notifier.mark_event(&self.key, event);
    }

    /// Whether the queue should accept another task under the current
    /// `queue_size_rejection_threshold`.
    ///
    /// Without a bounded queue this is always true and admission is left to
    /// the executor. The queue length is read without synchronisation and may
    /// already be stale.
    pub fn is_queue_space_available(&self) -> bool {
        if self.queue_size <= 0 {
            return true;
        }
        let queued = i64::try_from(self.executor.queue_len()).unwrap_or(i64::MAX);
        queued < i64::from(self.properties.queue_size_rejection_threshold())
    }

    /// Re-apply live properties to the executor. Sizes are only written when
    /// they differ from what the executor already has.
    fn touch_config(&self) {
        let properties = &self.properties;
        let dynamic_core_size = properties.core_size();
        let configured_maximum_size = properties.maximum_size();
        let allow_sizes_to_diverge = properties.allow_maximum_size_to_diverge_from_core_size();
        let mut dynamic_maximum_size = properties.actual_maximum_size();
        let mut maximum_too_low = false;

        if allow_sizes_to_diverge && configured_maximum_size < dynamic_core_size {
            dynamic_maximum_size = dynamic_core_size;
            maximum_too_low = true;
        }

        let core_size = strategy::to_size(dynamic_core_size);
        let maximum_size = strategy::to_size(dynamic_maximum_size).max(core_size).max(1);

        if self.executor.core_size() != core_size || self.executor.maximum_size() != maximum_size {
            if maximum_too_low {
                error!(
                    pool = %self.key,
                    core_size = dynamic_core_size,
                    maximum_size = configured_maximum_size,
                    "Pool configuration sets maximum size below core size. Maximum size will be set to {}, the core size value",
                    dynamic_maximum_size
                );
            }
            self.executor.set_pool_sizes(core_size, maximum_size);
        }

        self.executor
            .set_keep_alive(strategy::keep_alive(properties.keep_alive_time_minutes()));
    }
}
