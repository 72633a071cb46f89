// Logging System for Bulkhead
//
// This module provides a unified logging interface for isolation pools and
// their executors. It's built on top of the `tracing` ecosystem, which offers
// structured logging and span-based context.
//
// # Usage Examples
//
// ## Basic Initialization
//
// ```rust
// use bulkhead::logging;
//
// // Initialize with default settings (INFO level, console output)
// logging::init_default();
//
// // Or initialize with custom settings
// let config = logging::LogConfig {
//     level: tracing::Level::DEBUG,
//     json_format: false,
//     ..Default::default()
// };
// logging::init(config);
// ```
//
// ## Using Log Macros
//
// ```rust
// use bulkhead::{log_pool, pool_span};
//
// let span = pool_span!("payments");
// let _guard = span.enter();
//
// log_pool!("payments", "resized", core_size = 4);
// ```
//
// Worker threads spawned by `NamedThreadFactory` inherit the dispatcher that
// was current when the factory was built, see `current_subscriber`.

use std::sync::Once;
use tracing::{Level, Subscriber};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Configuration for the logging system
///
/// # Examples
///
/// ```rust
/// use bulkhead::logging::LogConfig;
/// use tracing::Level;
///
/// let custom_config = LogConfig {
///     level: Level::DEBUG,
///     json_format: true,
///     show_file_line: false,
///     show_thread_info: true,
///     show_time: true,
///     target_filters: Some("bulkhead=debug,bulkhead::executor=trace".to_string()),
/// };
/// ```
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: Level,
    /// Whether to use JSON format for logs
    pub json_format: bool,
    /// Whether to include file and line information
    pub show_file_line: bool,
    /// Whether to include thread name/id. Worker threads are named after
    /// their pool, so this is usually worth keeping on.
    pub show_thread_info: bool,
    /// Whether to include timestamps
    pub show_time: bool,
    /// Target filter expressions (format: "target=level,target2=level2,...")
    pub target_filters: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            show_file_line: true,
            show_thread_info: true,
            show_time: true,
            target_filters: None,
        }
    }
}

// Initialization guard to ensure we only initialize once
static INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Sets up the global tracing subscriber. It's safe to call multiple times;
/// only the first call will take effect. `RUST_LOG` directives are honored
/// alongside `config`.
pub fn init(config: LogConfig) {
    INIT.call_once(|| {
        let mut env_filter = EnvFilter::from_default_env().add_directive(config.level.into());

        if let Some(filters) = &config.target_filters {
            for filter in filters.split(',') {
                if let Ok(directive) = filter.parse() {
                    env_filter = env_filter.add_directive(directive);
                }
            }
        }

        let registry = tracing_subscriber::registry().with(env_filter);

        let subscriber: Box<dyn Subscriber + Send + Sync> = match (config.json_format, config.show_time) {
            (true, _) => Box::new(
                registry.with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
            (false, true) => Box::new(
                registry.with(
                    fmt::layer()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
            (false, false) => Box::new(
                registry.with(
                    fmt::layer()
                        .without_time()
                        .with_ansi(atty::is(atty::Stream::Stdout))
                        .with_file(config.show_file_line)
                        .with_line_number(config.show_file_line)
                        .with_thread_names(config.show_thread_info)
                        .with_thread_ids(config.show_thread_info),
                ),
            ),
        };

        set_global_subscriber(subscriber);
    });
}

// Helper function to set the global subscriber
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error setting global tracing subscriber: {}", err);
    }
}

/// Initialize default logging: INFO level with human-readable console output.
pub fn init_default() {
    init(LogConfig::default());
}

/// Initialize logging optimized for development environments
///
/// - DEBUG level for all bulkhead modules
/// - TRACE level for executor internals (worker spawn and retirement)
/// - Colorized console output with file/line information
pub fn init_development() {
    let config = LogConfig {
        level: Level::DEBUG,
        json_format: false,
        show_file_line: true,
        show_thread_info: true,
        show_time: true,
        target_filters: Some("bulkhead=debug,bulkhead::executor=trace".to_string()),
    };
    init(config);
}

/// Initialize logging optimized for production environments
///
/// JSON output for log aggregators, no file/line information.
pub fn init_production() {
    let config = LogConfig {
        level: Level::INFO,
        json_format: true,
        show_file_line: false,
        show_thread_info: true,
        show_time: true,
        target_filters: None,
    };
    init(config);
}

/// Initialize logging for testing
///
/// Only shows warnings and errors by default to keep test output clean.
///
/// ```rust
/// bulkhead::logging::init_test();
/// ```
pub fn init_test() {
    let config = LogConfig {
        level: Level::WARN,
        json_format: false,
        show_file_line: true,
        show_thread_info: false,
        show_time: false,
        target_filters: None,
    };
    init(config);
}

/// Create a span for work attributed to one pool
///
/// ```rust
/// use bulkhead::pool_span;
///
/// let span = pool_span!("payments");
/// let _guard = span.enter();
///
/// let span = pool_span!("payments", worker = 3);
/// ```
#[macro_export]
macro_rules! pool_span {
    ($pool:expr) => {
        tracing::info_span!("pool", pool = %$pool)
    };
    ($pool:expr, $($fields:tt)*) => {
        tracing::info_span!("pool", pool = %$pool, $($fields)*)
    };
}

/// Log pool lifecycle events - creation, resizing, shutdown
///
/// ```rust
/// use bulkhead::log_pool;
///
/// log_pool!("payments", "created");
/// log_pool!("payments", "resized", core_size = 4, maximum_size = 8);
/// ```
#[macro_export]
macro_rules! log_pool {
    ($pool:expr, $event:expr) => {
        tracing::info!(pool = %$pool, event = $event)
    };
    ($pool:expr, $event:expr, $($fields:tt)*) => {
        tracing::info!(pool = %$pool, event = $event, $($fields)*)
    };
}

/// Log error events - use for all error conditions
///
/// ```rust
/// use bulkhead::log_error;
///
/// let error = bulkhead::error::Interrupted;
/// log_error!(error);
/// log_error!(error, operation = "shutdown_all_and_wait");
/// ```
#[macro_export]
macro_rules! log_error {
    ($error:expr) => {
        tracing::error!(error = %$error)
    };
    ($error:expr, $($fields:tt)*) => {
        tracing::error!(error = %$error, $($fields)*)
    };
}

/// Get the current tracing dispatcher
///
/// Threads spawned by the executor install it so their logs use the same
/// configuration as the thread that built the pool.
#[inline]
pub fn current_subscriber() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|d| d.clone())
}

// Re-export the most commonly used tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
