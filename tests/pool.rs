//! Pool behavior: acquire paths, retirement policy, capacity invariants,
//! and the governor sweeps, driven through an in-process fake driver.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nimbus_core::config::load_config_str;
use nimbus_core::function::RuntimeClass;
use nimbus_core::pool::{PoolError, SandboxPool};

use common::{DriverHandle, FakeDriver};

fn registry(driver: &Arc<FakeDriver>, runtimes_toml: &str) -> SandboxPool {
    let config = load_config_str(runtimes_toml).unwrap();
    SandboxPool::new(Arc::new(DriverHandle(Arc::clone(driver))), config)
}

const ONE_SLOT: &str = r#"
    [runtimes."python3.11"]
    min_warm = 0
    target_warm = 1
    max_total = 1
"#;

#[tokio::test]
async fn acquire_release_round_trips_the_same_sandbox() {
    let driver = FakeDriver::new();
    let pool = registry(&driver, ONE_SLOT)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(lease.cold_start);
    let first_id = lease.sandbox_id().to_string();
    pool.release(lease, true).await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(!lease.cold_start);
    assert_eq!(lease.sandbox_id(), first_id);
    pool.release(lease, true).await;

    assert_eq!(driver.created.load(Ordering::SeqCst), 1);
    assert_eq!(driver.destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_caller_waits_and_gets_the_released_sandbox() {
    let driver = FakeDriver::new();
    let pool = registry(&driver, ONE_SLOT)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let held_id = lease.sandbox_id().to_string();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };
    // Let the waiter reach the wait path before releasing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.release(lease, true).await;
    let waited = waiter.await.unwrap().unwrap();
    assert!(!waited.cold_start);
    assert_eq!(waited.sandbox_id(), held_id);
    assert_eq!(driver.created.load(Ordering::SeqCst), 1);
    pool.release(waited, true).await;
}

#[tokio::test]
async fn acquire_times_out_when_capacity_is_held() {
    let driver = FakeDriver::new();
    let pool = registry(&driver, ONE_SLOT)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let err = pool.acquire(Duration::from_millis(100)).await.unwrap_err();
    assert!(matches!(err, PoolError::CapacityExhausted));
    // The rejected caller allocated nothing.
    assert_eq!(driver.created.load(Ordering::SeqCst), 1);

    pool.release(held, true).await;
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_max_total() {
    let driver = FakeDriver::new();
    let pool = registry(
        &driver,
        r#"
            [runtimes."python3.11"]
            min_warm = 0
            target_warm = 1
            max_total = 4
        "#,
    )
    .pool_for(RuntimeClass::Python311, 512)
    .await;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.release(lease, true).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert!(driver.created.load(Ordering::SeqCst) <= 4);
    let stats = pool.stats().await;
    assert!(stats.total <= 4);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn use_count_retirement_destroys_and_replaces() {
    let driver = FakeDriver::new();
    let config = load_config_str(
        r#"
            [pool]
            max_invocations_per_sandbox = 2

            [runtimes."python3.11"]
            max_total = 1
        "#,
    )
    .unwrap();
    let pool = SandboxPool::new(Arc::new(DriverHandle(Arc::clone(&driver))), config)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    // Two invocations wear the sandbox out.
    for _ in 0..2 {
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(lease, true).await;
    }
    // Retirement happened on the second release.
    assert_eq!(pool.stats().await.total, 0);

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(lease.cold_start);
    pool.release(lease, true).await;
    assert_eq!(driver.created.load(Ordering::SeqCst), 2);

    // The retirement destroy runs detached; give it a bounded moment.
    tokio::time::timeout(Duration::from_secs(1), async {
        while driver.destroyed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retired sandbox was never destroyed");
}

#[tokio::test]
async fn age_retirement_destroys_on_release() {
    let driver = FakeDriver::new();
    let config = load_config_str(
        r#"
            [pool]
            max_sandbox_age_secs = 0

            [runtimes."python3.11"]
            max_total = 1
        "#,
    )
    .unwrap();
    let pool = SandboxPool::new(Arc::new(DriverHandle(Arc::clone(&driver))), config)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.release(lease, true).await;

    assert_eq!(pool.stats().await.total, 0);
}

#[tokio::test]
async fn unhealthy_release_retires_instead_of_pooling() {
    let driver = FakeDriver::new();
    let pool = registry(&driver, ONE_SLOT)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(lease, false).await;
    assert_eq!(pool.stats().await.total, 0);

    // Wait for the detached destroy to land.
    tokio::time::timeout(Duration::from_secs(1), async {
        while driver.destroyed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("retired sandbox was never destroyed");
}

#[tokio::test]
async fn destroy_is_idempotent() {
    let driver = FakeDriver::new();
    let pool = registry(&driver, ONE_SLOT)
        .pool_for(RuntimeClass::Python311, 512)
        .await;

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let sandbox = Arc::clone(&lease.sandbox);
    pool.release(lease, false).await;

    sandbox.destroy().await.unwrap();
    sandbox.destroy().await.unwrap();
    assert_eq!(driver.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scale_up_prewarms_to_target() {
    let driver = FakeDriver::new();
    let pool = registry(
        &driver,
        r#"
            [runtimes."nodejs20"]
            min_warm = 2
            target_warm = 3
            max_total = 5
        "#,
    )
    .pool_for(RuntimeClass::NodeJs20, 512)
    .await;

    let created = pool.scale_up().await;
    assert_eq!(created, 3);
    let stats = pool.stats().await;
    assert_eq!(stats.warm, 3);
    assert_eq!(stats.busy, 0);

    // Warm reservoir satisfied; a second sweep is a no-op.
    assert_eq!(pool.scale_up().await, 0);

    // Acquire hits the warm reservoir, not the driver.
    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(!lease.cold_start);
    assert_eq!(driver.created.load(Ordering::SeqCst), 3);
    pool.release(lease, true).await;
}

#[tokio::test]
async fn health_sweep_evicts_failed_warm_sandboxes_only() {
    let driver = FakeDriver::new();
    let pool = registry(
        &driver,
        r#"
            [runtimes."python3.11"]
            min_warm = 0
            target_warm = 2
            max_total = 2
        "#,
    )
    .pool_for(RuntimeClass::Python311, 512)
    .await;

    // One warm, one busy.
    let warm = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let busy = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(warm, true).await;

    driver.all_unhealthy.store(true, Ordering::SeqCst);
    let evicted = pool.sweep_unhealthy(Duration::from_millis(100)).await;
    assert_eq!(evicted, 1, "busy sandboxes must not be probed");

    let stats = pool.stats().await;
    assert_eq!(stats.warm, 0);
    assert_eq!(stats.busy, 1);

    driver.all_unhealthy.store(false, Ordering::SeqCst);
    pool.release(busy, true).await;
}

#[tokio::test]
async fn drain_destroys_warm_and_busy_alike() {
    let driver = FakeDriver::new();
    let registry = registry(
        &driver,
        r#"
            [runtimes."python3.11"]
            max_total = 2
        "#,
    );
    let pool = registry.pool_for(RuntimeClass::Python311, 512).await;

    let warm = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let busy = pool.acquire(Duration::from_secs(1)).await.unwrap();
    pool.release(warm, true).await;

    registry.drain_all().await;
    assert_eq!(driver.destroyed.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().await.total, 0);

    // Releasing the interrupted lease after the drain is harmless.
    pool.release(busy, true).await;
    assert_eq!(pool.stats().await.total, 0);
}
