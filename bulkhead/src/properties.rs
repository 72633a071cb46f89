//! # Pool Properties
//!
//! Live configuration of an isolation pool. Values are read fresh every time a
//! pool reconciles its executor, so changing a [`DynamicPoolProperties`] value
//! takes effect on the next `executor()` / `scheduler()` call without
//! recreating anything.
//!
//! There is no snapshot guarantee: two reads during the same operation may
//! observe different values if the properties are changed concurrently.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::key::PoolKey;

pub const DEFAULT_CORE_SIZE: i32 = 10;
pub const DEFAULT_MAXIMUM_SIZE: i32 = 10;
pub const DEFAULT_KEEP_ALIVE_TIME_MINUTES: i32 = 1;
/// Negative or zero selects a direct hand-off instead of a bounded queue.
pub const DEFAULT_MAX_QUEUE_SIZE: i32 = -1;
pub const DEFAULT_QUEUE_SIZE_REJECTION_THRESHOLD: i32 = 5;
pub const DEFAULT_ALLOW_MAXIMUM_SIZE_TO_DIVERGE_FROM_CORE_SIZE: bool = false;

/// Live-readable settings of one pool.
///
/// Implementations must return the most recently set value on every call and
/// must not memoize.
pub trait PoolProperties: fmt::Debug + Send + Sync {
    /// Number of worker threads kept alive even when idle.
    fn core_size(&self) -> i32;

    /// Configured maximum number of worker threads. Only used when
    /// [`allow_maximum_size_to_diverge_from_core_size`](Self::allow_maximum_size_to_diverge_from_core_size)
    /// is set.
    fn maximum_size(&self) -> i32;

    /// Capacity of the work queue, fixed at executor creation.
    fn max_queue_size(&self) -> i32;

    /// Queue length at which new work is refused, may be lowered or raised
    /// at runtime up to `max_queue_size`.
    fn queue_size_rejection_threshold(&self) -> i32;

    /// Idle time after which workers above core size exit.
    fn keep_alive_time_minutes(&self) -> i32;

    fn allow_maximum_size_to_diverge_from_core_size(&self) -> bool;

    /// The maximum size that actually applies: `maximum_size` when sizes may
    /// diverge, `core_size` otherwise.
    fn actual_maximum_size(&self) -> i32 {
        if self.allow_maximum_size_to_diverge_from_core_size() {
            self.maximum_size()
        } else {
            self.core_size()
        }
    }
}

/// Optional overrides applied over the defaults when a pool's properties are
/// first created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolPropertiesSetter {
    pub core_size: Option<i32>,
    pub maximum_size: Option<i32>,
    pub max_queue_size: Option<i32>,
    pub queue_size_rejection_threshold: Option<i32>,
    pub keep_alive_time_minutes: Option<i32>,
    pub allow_maximum_size_to_diverge_from_core_size: Option<bool>,
}

impl PoolPropertiesSetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_core_size(mut self, value: i32) -> Self {
        self.core_size = Some(value);
        self
    }

    pub fn with_maximum_size(mut self, value: i32) -> Self {
        self.maximum_size = Some(value);
        self
    }

    pub fn with_max_queue_size(mut self, value: i32) -> Self {
        self.max_queue_size = Some(value);
        self
    }

    pub fn with_queue_size_rejection_threshold(mut self, value: i32) -> Self {
        self.queue_size_rejection_threshold = Some(value);
        self
    }

    pub fn with_keep_alive_time_minutes(mut self, value: i32) -> Self {
        self.keep_alive_time_minutes = Some(value);
        self
    }

    pub fn with_allow_maximum_size_to_diverge_from_core_size(mut self, value: bool) -> Self {
        self.allow_maximum_size_to_diverge_from_core_size = Some(value);
        self
    }
}

/// Atomically updatable [`PoolProperties`] for hot reload.
#[derive(Debug)]
pub struct DynamicPoolProperties {
    core_size: AtomicI32,
    maximum_size: AtomicI32,
    max_queue_size: AtomicI32,
    queue_size_rejection_threshold: AtomicI32,
    keep_alive_time_minutes: AtomicI32,
    allow_maximum_size_to_diverge_from_core_size: AtomicBool,
}

impl Default for DynamicPoolProperties {
    fn default() -> Self {
        Self::from_setter(&PoolPropertiesSetter::default())
    }
}

impl DynamicPoolProperties {
    /// Build properties from the defaults, overridden by whatever `setter`
    /// specifies.
    pub fn from_setter(setter: &PoolPropertiesSetter) -> Self {
        Self {
            core_size: AtomicI32::new(setter.core_size.unwrap_or(DEFAULT_CORE_SIZE)),
            maximum_size: AtomicI32::new(setter.maximum_size.unwrap_or(DEFAULT_MAXIMUM_SIZE)),
            max_queue_size: AtomicI32::new(setter.max_queue_size.unwrap_or(DEFAULT_MAX_QUEUE_SIZE)),
            queue_size_rejection_threshold: AtomicI32::new(
                setter
                    .queue_size_rejection_threshold
                    .unwrap_or(DEFAULT_QUEUE_SIZE_REJECTION_THRESHOLD),
            ),
            keep_alive_time_minutes: AtomicI32::new(
                setter
                    .keep_alive_time_minutes
                    .unwrap_or(DEFAULT_KEEP_ALIVE_TIME_MINUTES),
            ),
            allow_maximum_size_to_diverge_from_core_size: AtomicBool::new(
                setter
                    .allow_maximum_size_to_diverge_from_core_size
                    .unwrap_or(DEFAULT_ALLOW_MAXIMUM_SIZE_TO_DIVERGE_FROM_CORE_SIZE),
            ),
        }
    }

    pub fn set_core_size(&self, value: i32) {
        self.core_size.store(value, Ordering::SeqCst);
    }

    pub fn set_maximum_size(&self, value: i32) {
        self.maximum_size.store(value, Ordering::SeqCst);
    }

    /// Only affects executors created after the change.
    pub fn set_max_queue_size(&self, value: i32) {
        self.max_queue_size.store(value, Ordering::SeqCst);
    }

    pub fn set_queue_size_rejection_threshold(&self, value: i32) {
        self.queue_size_rejection_threshold.store(value, Ordering::SeqCst);
    }

    pub fn set_keep_alive_time_minutes(&self, value: i32) {
        self.keep_alive_time_minutes.store(value, Ordering::SeqCst);
    }

    pub fn set_allow_maximum_size_to_diverge_from_core_size(&self, value: bool) {
        self.allow_maximum_size_to_diverge_from_core_size
            .store(value, Ordering::SeqCst);
    }
}

impl PoolProperties for DynamicPoolProperties {
    fn core_size(&self) -> i32 {
        self.core_size.load(Ordering::SeqCst)
    }

    fn maximum_size(&self) -> i32 {
        self.maximum_size.load(Ordering::SeqCst)
    }

    fn max_queue_size(&self) -> i32 {
        self.max_queue_size.load(Ordering::SeqCst)
    }

    fn queue_size_rejection_threshold(&self) -> i32 {
        self.queue_size_rejection_threshold.load(Ordering::SeqCst)
    }

    fn keep_alive_time_minutes(&self) -> i32 {
        self.keep_alive_time_minutes.load(Ordering::SeqCst)
    }

    fn allow_maximum_size_to_diverge_from_core_size(&self) -> bool {
        self.allow_maximum_size_to_diverge_from_core_size
            .load(Ordering::SeqCst)
    }
}

/// Resolves the live properties object for a pool.
pub trait PropertiesStrategy: fmt::Debug + Send + Sync {
    /// Properties for `key`, seeded from `defaults` on first resolution.
    fn pool_properties(&self, key: &PoolKey, defaults: &PoolPropertiesSetter) -> Arc<dyn PoolProperties>;

    /// Drop any cached properties.
    fn reset(&self) {}
}

/// Default [`PropertiesStrategy`]: one [`DynamicPoolProperties`] per key,
/// cached so that callers can fetch the same live handle with
/// [`properties_for`](Self::properties_for) and change it.
#[derive(Debug, Default)]
pub struct CachedPropertiesStrategy {
    cache: DashMap<PoolKey, Arc<DynamicPoolProperties>>,
}

impl CachedPropertiesStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live properties previously resolved for `key`, if any.
    pub fn properties_for(&self, key: &PoolKey) -> Option<Arc<DynamicPoolProperties>> {
        self.cache.get(key).map(|entry| entry.value().clone())
    }
}

impl PropertiesStrategy for CachedPropertiesStrategy {
    fn pool_properties(&self, key: &PoolKey, defaults: &PoolPropertiesSetter) -> Arc<dyn PoolProperties> {
        self.cache
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(pool = %key, ?defaults, "Creating pool properties");
                Arc::new(DynamicPoolProperties::from_setter(defaults))
            })
            .value()
            .clone()
    }

    fn reset(&self) {
        self.cache.clear();
    }
}
