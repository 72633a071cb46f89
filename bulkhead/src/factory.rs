//! # Pool Registry
//!
//! Hands out one [`IsolationPool`] per key and shuts every pool down on
//! request.
//!
//! ## Key Concepts
//! - Wrapper cache: lookups of an existing key are lock-free; the first
//!   lookup of a key takes a registry-wide construction lock and re-checks
//!   before building, so exactly one wrapper is ever published per key
//! - Executors are resolved through the registry's [`ExecutorRegistry`], so
//!   even wrappers built outside this registry share the same executor
//! - Properties are resolved through a [`PropertiesStrategy`]; the defaults
//!   passed to [`get_instance`](PoolRegistry::get_instance) only matter the
//!   first time a key is seen
//!
//! ## Shutdown
//! [`shutdown_all`](PoolRegistry::shutdown_all) signals every executor and
//! forgets them without waiting.
//! [`shutdown_all_and_wait`](PoolRegistry::shutdown_all_and_wait) signals
//! them all first, then waits for each in turn. Being interrupted during
//! that wait is fatal: the error names the pool, the remaining pools are not
//! waited on and nothing is cleared.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{PoolError, ShutdownError};
use crate::events::{EventNotifier, NoopEventNotifier};
use crate::key::PoolKey;
use crate::pool::IsolationPool;
use crate::properties::{CachedPropertiesStrategy, PoolPropertiesSetter, PropertiesStrategy};
use crate::registry::ExecutorRegistry;
use crate::strategy::{ConcurrencyStrategy, DefaultConcurrencyStrategy};
use crate::{log_error, log_pool, pool_span};

lazy_static! {
    static ref GLOBAL: PoolRegistry = PoolRegistry::default();
}

/// Process-wide cache of isolation pools.
pub struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<IsolationPool>>,
    /// Serializes wrapper construction across all keys.
    construction_lock: Mutex<()>,
    executors: ExecutorRegistry,
    properties: Arc<dyn PropertiesStrategy>,
    notifier: Arc<dyn EventNotifier>,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pools.len())
            .field("executors", &self.executors)
            .field("properties", &self.properties)
            .field("notifier", &self.notifier)
            .finish()
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new(
            Arc::new(DefaultConcurrencyStrategy),
            Arc::new(CachedPropertiesStrategy::new()),
            Arc::new(NoopEventNotifier),
        )
    }
}

impl PoolRegistry {
    pub fn new(
        concurrency: Arc<dyn ConcurrencyStrategy>,
        properties: Arc<dyn PropertiesStrategy>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        Self {
            pools: DashMap::new(),
            construction_lock: Mutex::new(()),
            executors: ExecutorRegistry::new(concurrency),
            properties,
            notifier,
        }
    }

    /// The registry shared by the whole process, built with the default
    /// strategies.
    pub fn global() -> &'static PoolRegistry {
        &GLOBAL
    }

    /// The pool for `key`, creating it on first use.
    ///
    /// `defaults` seed the pool's properties when the key is first seen and
    /// are ignored afterwards.
    pub fn get_instance(&self, key: &PoolKey, defaults: &PoolPropertiesSetter) -> Arc<IsolationPool> {
        if let Some(existing) = self.pools.get(key) {
            return existing.value().clone();
        }

        let _construction = self.construction_lock.lock();
        if let Some(existing) = self.pools.get(key) {
            return existing.value().clone();
        }

        let span = pool_span!(key);
        let _enter = span.enter();
        let properties = self.properties.pool_properties(key, defaults);
        let pool = Arc::new(IsolationPool::new(
            key.clone(),
            properties,
            &self.executors,
            self.notifier.clone(),
        ));
        self.pools.insert(key.clone(), pool.clone());
        log_pool!(key, "created", queue_size = pool.queue_size());
        pool
    }

    /// The pool for `key` if it has been created.
    pub fn get(&self, key: &PoolKey) -> Result<Arc<IsolationPool>, PoolError> {
        self.pools
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::NotFound(key.clone()))
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Keys of every cached pool, in no particular order.
    pub fn keys(&self) -> Vec<PoolKey> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn properties_strategy(&self) -> &Arc<dyn PropertiesStrategy> {
        &self.properties
    }

    /// Signal every pool's executor to shut down and forget all pools and
    /// executors. Does not wait for running work.
    pub fn shutdown_all(&self) {
        let _construction = self.construction_lock.lock();
        let pools = self.snapshot();
        for pool in &pools {
            pool.raw_executor().shutdown();
        }
        self.clear();
        info!(pools = pools.len(), "Shut down all pools");
    }

    /// Signal every pool's executor to shut down, then wait up to `timeout`
    /// for each one in turn to terminate before forgetting them.
    ///
    /// The timeout applies to each pool separately. A pool that does not
    /// terminate in time is waited on again until it does. Pools are awaited
    /// in key order.
    ///
    /// The construction lock is only held while signalling, so work still
    /// draining may create pools for other keys. Those pools are not part of
    /// this shutdown and stay registered.
    pub fn shutdown_all_and_wait(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let pools = {
            let _construction = self.construction_lock.lock();
            let pools = self.snapshot();
            for pool in &pools {
                pool.raw_executor().shutdown();
            }
            pools
        };

        for pool in &pools {
            loop {
                match pool.raw_executor().await_termination(timeout) {
                    Ok(true) => break,
                    Ok(false) => {
                        debug!(pool = %pool.key(), ?timeout, "Still waiting for pool to terminate");
                    }
                    Err(_) => {
                        let err = ShutdownError::Interrupted {
                            pool: pool.key().clone(),
                        };
                        log_error!(err, pool = %pool.key(), operation = "shutdown_all_and_wait");
                        return Err(err);
                    }
                }
            }
        }

        for pool in &pools {
            self.forget(pool);
        }
        info!(pools = pools.len(), "All pools terminated");
        Ok(())
    }

    /// Shut every pool down and drop cached properties, so the next lookup
    /// of any key starts from fresh defaults.
    pub fn reset(&self) {
        self.shutdown_all();
        self.properties.reset();
    }

    /// Every cached pool, sorted by key.
    fn snapshot(&self) -> Vec<Arc<IsolationPool>> {
        let mut pools: Vec<_> = self.pools.iter().map(|entry| entry.value().clone()).collect();
        pools.sort_by(|a, b| a.key().cmp(b.key()));
        pools
    }

    /// Drop `pool` and its executor unless they were already replaced.
    fn forget(&self, pool: &Arc<IsolationPool>) {
        self.pools
            .remove_if(pool.key(), |_, cached| Arc::ptr_eq(cached, pool));
        self.executors.remove_if_same(pool.key(), pool.raw_executor());
    }

    fn clear(&self) {
        self.pools.clear();
        self.executors.clear();
    }
}
