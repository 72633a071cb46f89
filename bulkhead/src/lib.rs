// Bulkhead: execution isolation through named, bounded thread pools
//
// Each class of work is identified by a `PoolKey` and runs on its own
// executor, so a slow or failing dependency can only exhaust the threads of
// its own pool. Pools are created lazily through a `PoolRegistry`, sized from
// live `PoolProperties` that are re-applied every time the pool is used, and
// expose a scheduler whose tasks can be cancelled with cooperative thread
// interruption.

pub mod error;
pub mod events;
pub mod executor;
pub mod factory;
pub mod interrupt;
pub mod key;
pub mod logging;
pub mod pool;
pub mod properties;
pub mod registry;
pub mod scheduler;
pub mod strategy;

// Re-export commonly used types
pub use error::{Interrupted, PoolError, RejectedExecution, ScheduleError, ShutdownError};
pub use events::{EventNotifier, NoopEventNotifier, PoolEvent, PoolMetrics};
pub use executor::{ExecutorConfig, Job, NamedThreadFactory, ThreadFactory, ThreadPoolExecutor};
pub use factory::PoolRegistry;
pub use interrupt::Interrupter;
pub use key::PoolKey;
pub use pool::IsolationPool;
pub use properties::{
    CachedPropertiesStrategy, DynamicPoolProperties, PoolProperties, PoolPropertiesSetter, PropertiesStrategy,
};
pub use registry::ExecutorRegistry;
pub use scheduler::{PoolScheduler, ScheduledTask, TaskState, Worker};
pub use strategy::{ConcurrencyStrategy, DefaultConcurrencyStrategy};
