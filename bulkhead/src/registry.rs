//! # Executor Registry
//!
//! Process-wide cache guaranteeing that at most one executor is ever built
//! per pool key, however many isolation pool wrappers are created for it and
//! however many threads race on first use.
//!
//! Construction runs inside the map's per-shard entry lock, never under a
//! lock spanning every key, so unrelated keys are not blocked while a
//! strategy builds an executor.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::executor::ThreadPoolExecutor;
use crate::key::PoolKey;
use crate::properties::PoolProperties;
use crate::strategy::{ConcurrencyStrategy, DefaultConcurrencyStrategy};

/// Owner of every executor, keyed by pool name.
pub struct ExecutorRegistry {
    executors: DashMap<PoolKey, Arc<ThreadPoolExecutor>>,
    strategy: Arc<dyn ConcurrencyStrategy>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.executors.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConcurrencyStrategy))
    }
}

impl ExecutorRegistry {
    pub fn new(strategy: Arc<dyn ConcurrencyStrategy>) -> Self {
        Self {
            executors: DashMap::new(),
            strategy,
        }
    }

    /// The strategy executors are built with.
    pub fn strategy(&self) -> &Arc<dyn ConcurrencyStrategy> {
        &self.strategy
    }

    /// The executor for `key`, built from `properties` by the strategy on
    /// first resolution. Concurrent first resolutions build exactly once and
    /// all observe the same executor.
    pub fn resolve(&self, key: &PoolKey, properties: &dyn PoolProperties) -> Arc<ThreadPoolExecutor> {
        if let Some(existing) = self.executors.get(key) {
            return existing.value().clone();
        }

        self.executors
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(pool = %key, "Creating executor through concurrency strategy");
                self.strategy.create_executor(key, properties)
            })
            .value()
            .clone()
    }

    /// The executor for `key` if one has been built.
    pub fn get(&self, key: &PoolKey) -> Option<Arc<ThreadPoolExecutor>> {
        self.executors.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Forget the executor for `key` if it is still `executor`.
    pub fn remove_if_same(&self, key: &PoolKey, executor: &Arc<ThreadPoolExecutor>) -> bool {
        self.executors
            .remove_if(key, |_, cached| Arc::ptr_eq(cached, executor))
            .is_some()
    }

    /// Forget every executor. Does not shut them down.
    pub fn clear(&self) {
        self.executors.clear();
    }
}
