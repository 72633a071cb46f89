//! # Concurrency Strategy
//!
//! The seam through which hosting applications control how worker threads
//! and executors are built. The isolation pool never constructs an executor
//! itself; it always asks the strategy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::executor::{ExecutorConfig, Job, NamedThreadFactory, ThreadFactory, ThreadPoolExecutor};
use crate::key::PoolKey;
use crate::properties::PoolProperties;

/// Factory for the executors backing isolation pools.
pub trait ConcurrencyStrategy: fmt::Debug + Send + Sync {
    /// Build the executor for `key`, sized from the current `properties`.
    fn create_executor(&self, key: &PoolKey, properties: &dyn PoolProperties) -> Arc<ThreadPoolExecutor>;

    /// Decorate a task before it is submitted, e.g. to carry thread-local
    /// context from the submitting thread onto the worker.
    fn wrap_task(&self, task: Job) -> Job {
        task
    }
}

/// Default strategy: one [`ThreadPoolExecutor`] per key whose threads are
/// named `bulkhead-<key>-<n>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConcurrencyStrategy;

impl DefaultConcurrencyStrategy {
    /// The thread factory used for `key`.
    pub fn thread_factory(&self, key: &PoolKey) -> Arc<dyn ThreadFactory> {
        Arc::new(NamedThreadFactory::new(format!("bulkhead-{}", key.name())))
    }
}

impl ConcurrencyStrategy for DefaultConcurrencyStrategy {
    fn create_executor(&self, key: &PoolKey, properties: &dyn PoolProperties) -> Arc<ThreadPoolExecutor> {
        let config = executor_config(key, properties);
        Arc::new(ThreadPoolExecutor::new(config, self.thread_factory(key)))
    }
}

/// Derive the initial executor sizing for `key` from its properties.
pub fn executor_config(key: &PoolKey, properties: &dyn PoolProperties) -> ExecutorConfig {
    let allow_sizes_to_diverge = properties.allow_maximum_size_to_diverge_from_core_size();
    let core_size = properties.core_size();
    let maximum_size = properties.maximum_size();

    let (core_size, maximum_size) = if allow_sizes_to_diverge {
        if core_size > maximum_size {
            error!(
                pool = %key,
                core_size,
                maximum_size,
                "Pool is trying to set maximum size below core size. Maximum size will be set to {}, the core size value",
                core_size
            );
            (core_size, core_size)
        } else {
            (core_size, maximum_size)
        }
    } else {
        (core_size, core_size)
    };

    let max_queue_size = properties.max_queue_size();
    ExecutorConfig {
        name: key.name().to_string(),
        core_size: to_size(core_size),
        maximum_size: to_size(maximum_size),
        keep_alive: keep_alive(properties.keep_alive_time_minutes()),
        queue_capacity: if max_queue_size <= 0 {
            None
        } else {
            Some(to_size(max_queue_size))
        },
    }
}

/// Clamp a configured size to a usable thread count.
pub(crate) fn to_size(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

pub(crate) fn keep_alive(minutes: i32) -> Duration {
    Duration::from_secs(60 * u64::try_from(minutes).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{DynamicPoolProperties, PoolPropertiesSetter};

    #[test]
    fn test_sizes_collapse_to_core_without_divergence() {
        let props = DynamicPoolProperties::from_setter(
            &PoolPropertiesSetter::new().with_core_size(4).with_maximum_size(9),
        );
        let config = executor_config(&PoolKey::new("cfg-core"), &props);
        assert_eq!(config.core_size, 4);
        assert_eq!(config.maximum_size, 4);
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
    }

    #[test]
    fn test_divergent_sizes_clamped_when_maximum_too_low() {
        let props = DynamicPoolProperties::from_setter(
            &PoolPropertiesSetter::new()
                .with_allow_maximum_size_to_diverge_from_core_size(true)
                .with_core_size(10)
                .with_maximum_size(5)
                .with_max_queue_size(50),
        );
        let config = executor_config(&PoolKey::new("cfg-clamp"), &props);
        assert_eq!(config.core_size, 10);
        assert_eq!(config.maximum_size, 10);
        assert_eq!(config.queue_capacity, Some(50));
    }

    #[test]
    fn test_default_strategy_names_executor_after_key() {
        let props = DynamicPoolProperties::default();
        let executor = DefaultConcurrencyStrategy.create_executor(&PoolKey::new("cfg-name"), &props);
        assert_eq!(executor.name(), "cfg-name");
        assert_eq!(executor.core_size(), 10);
    }
}
