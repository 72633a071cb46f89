// Integration tests for pool and executor registries in bulkhead::factory

use bulkhead::interrupt;
use bulkhead::*;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn blocking_task(pool: &Arc<IsolationPool>) -> mpsc::Sender<()> {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (started_tx, started_rx) = mpsc::channel();
    pool.executor()
        .execute(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(10));
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    release_tx
}

#[test]
fn test_concurrent_get_instance_yields_single_pool() {
    logging::init_test();
    let registry = Arc::new(PoolRegistry::default());
    let barrier = Arc::new(Barrier::new(10));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                registry.get_instance(&PoolKey::new("shared"), &PoolPropertiesSetter::new())
            })
        })
        .collect();

    let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for pool in &pools {
        assert!(Arc::ptr_eq(pool, &pools[0]));
        assert!(Arc::ptr_eq(pool.executor(), pools[0].executor()));
    }
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.executors().len(), 1);
}

#[test]
fn test_wrappers_outside_registry_share_executor() {
    let registry = PoolRegistry::default();
    let key = PoolKey::new("outside");
    let cached = registry.get_instance(&key, &PoolPropertiesSetter::new());

    let standalone = IsolationPool::without_notifier(
        key.clone(),
        Arc::new(DynamicPoolProperties::default()),
        registry.executors(),
    );
    assert!(Arc::ptr_eq(cached.executor(), standalone.executor()));
}

#[test]
fn test_global_registry_is_shared() {
    let key = PoolKey::new("global-registry-test");
    let a = PoolRegistry::global().get_instance(&key, &PoolPropertiesSetter::new());
    let b = PoolRegistry::global().get_instance(&key, &PoolPropertiesSetter::new());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(PoolRegistry::global().get(&key).is_ok());
}

#[test]
fn test_shutdown_all_clears_registries() {
    let registry = PoolRegistry::default();
    let a = registry.get_instance(&PoolKey::new("down-a"), &PoolPropertiesSetter::new());
    let b = registry.get_instance(&PoolKey::new("down-b"), &PoolPropertiesSetter::new());

    registry.shutdown_all();

    assert!(registry.is_empty());
    assert!(registry.executors().is_empty());
    assert!(a.executor().is_shutdown());
    assert!(b.executor().is_shutdown());
    assert!(matches!(
        a.executor().execute(|| {}),
        Err(RejectedExecution::Shutdown(_))
    ));

    // A later lookup builds a fresh, running pool.
    let fresh = registry.get_instance(&PoolKey::new("down-a"), &PoolPropertiesSetter::new());
    assert!(!Arc::ptr_eq(&fresh, &a));
    assert!(!fresh.executor().is_shutdown());
}

#[test]
fn test_shutdown_all_and_wait_waits_for_running_work() {
    let registry = PoolRegistry::default();
    let pool = registry.get_instance(&PoolKey::new("wait-running"), &PoolPropertiesSetter::new());
    let release = blocking_task(&pool);

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        release.send(()).unwrap();
    });

    let start = Instant::now();
    assert_eq!(registry.shutdown_all_and_wait(Duration::from_millis(20)), Ok(()));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(pool.executor().is_terminated());
    assert!(registry.is_empty());
    releaser.join().unwrap();
}

#[test]
fn test_interrupted_wait_is_fatal() {
    let registry = Arc::new(PoolRegistry::default());
    let first_key = PoolKey::new("wait-interrupted-a");
    let second_key = PoolKey::new("wait-interrupted-b");
    let first = registry.get_instance(&first_key, &PoolPropertiesSetter::new());
    let second = registry.get_instance(&second_key, &PoolPropertiesSetter::new());
    let release_first = blocking_task(&first);
    let release_second = blocking_task(&second);

    let (interrupter_tx, interrupter_rx) = mpsc::channel();
    let waiter = {
        let registry = registry.clone();
        thread::spawn(move || {
            interrupter_tx.send(interrupt::current()).unwrap();
            let start = Instant::now();
            let result = registry.shutdown_all_and_wait(Duration::from_secs(5));
            (result, start.elapsed())
        })
    };

    let interrupter = interrupter_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(50));
    interrupter.interrupt();

    let (result, elapsed) = waiter.join().unwrap();
    let err = result.unwrap_err();
    assert!(err.is_fatal());
    // Pools are awaited in key order; the wait stops at the first one.
    assert_eq!(err, ShutdownError::Interrupted { pool: first_key.clone() });
    assert!(elapsed < Duration::from_secs(2));
    assert!(!second.executor().is_terminated());

    // Both pools were signalled but nothing was cleared.
    assert!(first.executor().is_shutdown());
    assert!(second.executor().is_shutdown());
    assert!(registry.get(&first_key).is_ok());
    assert!(registry.get(&second_key).is_ok());

    release_first.send(()).unwrap();
    release_second.send(()).unwrap();
    assert_eq!(first.executor().await_termination(Duration::from_secs(5)), Ok(true));
    assert_eq!(second.executor().await_termination(Duration::from_secs(5)), Ok(true));
}

#[test]
fn test_draining_work_can_create_pools_during_wait() {
    let registry = Arc::new(PoolRegistry::default());
    let outer = registry.get_instance(&PoolKey::new("nested-outer"), &PoolPropertiesSetter::new());

    let (created_tx, created_rx) = mpsc::channel();
    {
        let registry = registry.clone();
        outer
            .executor()
            .execute(move || {
                thread::sleep(Duration::from_millis(100));
                let inner = registry.get_instance(&PoolKey::new("nested-inner"), &PoolPropertiesSetter::new());
                created_tx.send(inner).unwrap();
            })
            .unwrap();
    }

    let (done_tx, done_rx) = mpsc::channel();
    {
        let registry = registry.clone();
        thread::spawn(move || {
            done_tx.send(registry.shutdown_all_and_wait(Duration::from_millis(50))).unwrap();
        });
    }

    assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)), Ok(Ok(())));
    let inner = created_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(outer.executor().is_terminated());

    // Created after the shutdown began, so it is left running and registered.
    assert!(registry.get(&PoolKey::new("nested-outer")).is_err());
    assert!(Arc::ptr_eq(&registry.get(&PoolKey::new("nested-inner")).unwrap(), &inner));
    assert!(!inner.executor().is_shutdown());

    registry.shutdown_all();
}

#[test]
fn test_properties_strategy_handle_is_live() {
    let properties = Arc::new(CachedPropertiesStrategy::new());
    let registry = PoolRegistry::new(
        Arc::new(DefaultConcurrencyStrategy),
        properties.clone(),
        Arc::new(NoopEventNotifier),
    );
    let key = PoolKey::new("live-handle");
    let pool = registry.get_instance(&key, &PoolPropertiesSetter::new().with_core_size(3));
    assert_eq!(pool.executor().core_size(), 3);

    properties.properties_for(&key).unwrap().set_core_size(7);
    assert_eq!(pool.executor().core_size(), 7);
    assert_eq!(pool.executor().maximum_size(), 7);
}
