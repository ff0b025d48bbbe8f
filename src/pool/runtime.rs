//! Single-runtime reservoir of reusable sandboxes.
//!
//! A [`RuntimePool`] holds a bounded channel of warm sandbox ids, a table of
//! every live sandbox, and a counter of in-flight creations. The channel
//! provides its own synchronization; the table and counter sit behind one
//! mutex. The invariant the whole file defends is
//! `warm + busy + creating <= max_total`: growth reserves a `creating` slot
//! under the lock before any driver call, so concurrent acquires can never
//! overshoot the cap.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::driver::{DriverError, DynSandbox, SandboxDriver, SandboxSpec};
use crate::function::RuntimeClass;

use serde::Serialize;

/// Errors surfaced by [`RuntimePool::acquire`].
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("timed out waiting for sandbox capacity")]
    CapacityExhausted,

    #[error("the pool is shutting down")]
    Terminated,

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Where a live sandbox currently is.
///
/// A sandbox selected for destruction leaves the live table in the same
/// critical section that selects it, so there is no separate draining
/// state: every claim goes through the table, and a removed sandbox can
/// never be handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Idle and available for immediate exec.
    Warm,
    /// Bound to an in-flight invocation.
    Busy,
}

/// Sizing and retirement policy for one runtime pool.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    pub min_warm: usize,
    pub target_warm: usize,
    pub max_total: usize,
    pub max_invocations: u32,
    pub max_sandbox_age: Duration,
    pub scale_up_factor: f64,
}

/// Point-in-time counts for one runtime pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub warm: usize,
    pub busy: usize,
    pub total: usize,
    pub max: usize,
}

/// A sandbox borrowed from the pool for exactly one exec.
///
/// Return it with [`RuntimePool::release`]; dropping a lease without
/// releasing leaks the busy slot until shutdown.
pub struct Lease {
    pub sandbox: DynSandbox,
    pub cold_start: bool,
    id: String,
}

impl Lease {
    pub fn sandbox_id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("cold_start", &self.cold_start)
            .finish()
    }
}

struct SandboxEntry {
    sandbox: DynSandbox,
    created_at: Instant,
    last_used: Instant,
    use_count: u32,
    status: SandboxStatus,
}

struct PoolInner {
    live: HashMap<String, SandboxEntry>,
    creating: usize,
}

/// Reservoir of warm sandboxes for one (runtime class, memory cap) pair.
pub struct RuntimePool {
    runtime: RuntimeClass,
    spec: SandboxSpec,
    limits: PoolLimits,
    driver: std::sync::Arc<dyn SandboxDriver>,
    warm_tx: mpsc::Sender<String>,
    warm_rx: Mutex<mpsc::Receiver<String>>,
    inner: Mutex<PoolInner>,
}

impl RuntimePool {
    pub fn new(
        spec: SandboxSpec,
        limits: PoolLimits,
        driver: std::sync::Arc<dyn SandboxDriver>,
    ) -> Self {
        let (warm_tx, warm_rx) = mpsc::channel(limits.max_total.max(1));
        Self {
            runtime: spec.runtime,
            spec,
            limits,
            driver,
            warm_tx,
            warm_rx: Mutex::new(warm_rx),
            inner: Mutex::new(PoolInner { live: HashMap::new(), creating: 0 }),
        }
    }

    pub fn runtime(&self) -> RuntimeClass {
        self.runtime
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    /// Borrows a sandbox for one invocation.
    ///
    /// Fast path: a non-blocking receive from the warm channel. Growth
    /// path: when capacity allows, create a new sandbox (a cold start).
    /// Wait path: block on the warm channel until `deadline` elapses.
    pub async fn acquire(&self, deadline: Duration) -> Result<Lease, PoolError> {
        // Fast path. If a waiter already holds the receiver the channel is
        // being drained as fast as it fills; skip straight to growth.
        if let Ok(mut rx) = self.warm_rx.try_lock() {
            while let Ok(id) = rx.try_recv() {
                if let Some(lease) = self.claim_warm(id).await {
                    return Ok(lease);
                }
                // Stale id (retired since it was queued); keep draining.
            }
        }

        // Growth path: reserve a creating slot under the lock, then create
        // outside it. Tie-breaks favor growth over waiting to minimize
        // latency when capacity allows.
        {
            let mut inner = self.inner.lock().await;
            if inner.live.len() + inner.creating < self.limits.max_total {
                inner.creating += 1;
                drop(inner);
                return self.create_busy().await;
            }
        }

        // Wait path.
        let waited = tokio::time::timeout(deadline, async {
            let mut rx = self.warm_rx.lock().await;
            loop {
                match rx.recv().await {
                    Some(id) => {
                        if let Some(lease) = self.claim_warm(id).await {
                            return Some(lease);
                        }
                    }
                    None => return None,
                }
            }
        })
        .await;

        match waited {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(PoolError::Terminated),
            Err(_) => Err(PoolError::CapacityExhausted),
        }
    }

    /// Returns a borrowed sandbox.
    ///
    /// Unhealthy, over-used, or over-aged sandboxes are retired (destroyed)
    /// instead of rejoining the warm channel. A full warm channel also
    /// retires: bounded capacity wins over retention.
    pub async fn release(&self, lease: Lease, healthy: bool) {
        let Lease { id, sandbox: _, .. } = lease;
        let retired = {
            let mut inner = self.inner.lock().await;
            let Some(entry) = inner.live.get_mut(&id) else {
                // Already drained (shutdown or health sweep won the race).
                return;
            };

            let worn_out = entry.use_count >= self.limits.max_invocations
                || entry.created_at.elapsed() > self.limits.max_sandbox_age;
            if !healthy || worn_out {
                inner.live.remove(&id).map(|e| (e.sandbox, "retired"))
            } else {
                entry.status = SandboxStatus::Warm;
                match self.warm_tx.try_send(id.clone()) {
                    Ok(()) => None,
                    Err(_) => {
                        inner.live.remove(&id).map(|e| (e.sandbox, "warm channel full"))
                    }
                }
            }
        };

        if let Some((sandbox, reason)) = retired {
            debug!(sandbox_id = %id, runtime = %self.runtime, reason, "retiring sandbox");
            destroy_detached(sandbox);
        }
    }

    /// Health sweep: probe every warm sandbox and retire the ones that fail
    /// the ping or have outlived `max_sandbox_age`. Busy sandboxes are
    /// never probed.
    ///
    /// The scan holds this pool's lock for its duration; probes are short
    /// and the lock covers a single runtime only.
    pub async fn sweep_unhealthy(&self, ping_deadline: Duration) -> usize {
        let mut inner = self.inner.lock().await;

        let mut doomed = Vec::new();
        for (id, entry) in inner.live.iter() {
            if entry.status != SandboxStatus::Warm {
                continue;
            }
            if entry.created_at.elapsed() > self.limits.max_sandbox_age {
                doomed.push((id.clone(), "over max age"));
            } else if !entry.sandbox.health_ping(ping_deadline).await {
                doomed.push((id.clone(), "failed health ping"));
            }
        }

        let count = doomed.len();
        for (id, reason) in doomed {
            if let Some(entry) = inner.live.remove(&id) {
                warn!(sandbox_id = %id, runtime = %self.runtime, reason, "evicting sandbox");
                destroy_detached(entry.sandbox);
            }
        }
        count
    }

    /// Scaling sweep: when the warm reservoir is below `min_warm`, create
    /// sandboxes concurrently toward `target_warm`, bounded by remaining
    /// capacity and the per-tick `scale_up_factor` cap. Returns how many
    /// were created.
    pub async fn scale_up(&self) -> usize {
        let to_create = {
            let mut inner = self.inner.lock().await;
            let warm = inner
                .live
                .values()
                .filter(|e| e.status == SandboxStatus::Warm)
                .count();
            if warm >= self.limits.min_warm {
                return 0;
            }
            let capacity = self
                .limits
                .max_total
                .saturating_sub(inner.live.len() + inner.creating);
            let deficit = self.limits.target_warm.saturating_sub(warm).min(capacity);
            if deficit == 0 {
                return 0;
            }
            let burst = (deficit as f64 * self.limits.scale_up_factor).ceil() as usize;
            let n = burst.clamp(1, deficit);
            inner.creating += n;
            n
        };

        debug!(runtime = %self.runtime, count = to_create, "pre-warming sandboxes");
        let created: usize = join_all((0..to_create).map(|_| self.create_warm()))
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        created
    }

    /// Snapshot of the pool's counts, taken under the lock so `busy` is
    /// derived from status rather than subtraction.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let warm = inner.live.values().filter(|e| e.status == SandboxStatus::Warm).count();
        let busy = inner.live.values().filter(|e| e.status == SandboxStatus::Busy).count();
        PoolStats { warm, busy, total: inner.live.len(), max: self.limits.max_total }
    }

    /// Destroys every live sandbox, warm and busy alike. Busy destruction
    /// interrupts the in-flight exec with a driver error.
    pub async fn drain_all(&self) {
        let doomed: Vec<(String, DynSandbox)> = {
            let mut inner = self.inner.lock().await;
            inner.live.drain().map(|(id, entry)| (id, entry.sandbox)).collect()
        };
        if doomed.is_empty() {
            return;
        }
        debug!(runtime = %self.runtime, count = doomed.len(), "draining pool");
        join_all(doomed.into_iter().map(|(id, sandbox)| async move {
            if let Err(e) = sandbox.destroy().await {
                warn!(sandbox_id = %id, error = %e, "failed to destroy sandbox during drain");
            }
        }))
        .await;
    }

    async fn claim_warm(&self, id: String) -> Option<Lease> {
        let mut inner = self.inner.lock().await;
        let entry = inner.live.get_mut(&id)?;
        if entry.status != SandboxStatus::Warm {
            return None;
        }
        entry.status = SandboxStatus::Busy;
        entry.last_used = Instant::now();
        entry.use_count += 1;
        Some(Lease { sandbox: entry.sandbox.clone(), cold_start: false, id })
    }

    /// Growth-path create. The caller has already reserved a `creating`
    /// slot; both arms release it.
    async fn create_busy(&self) -> Result<Lease, PoolError> {
        match self.driver.create(&self.spec).await {
            Ok(sandbox) => {
                let id = sandbox.id().to_string();
                let now = Instant::now();
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                inner.live.insert(
                    id.clone(),
                    SandboxEntry {
                        sandbox: sandbox.clone(),
                        created_at: now,
                        last_used: now,
                        use_count: 1,
                        status: SandboxStatus::Busy,
                    },
                );
                Ok(Lease { sandbox, cold_start: true, id })
            }
            Err(e) => {
                self.inner.lock().await.creating -= 1;
                Err(PoolError::Driver(e))
            }
        }
    }

    /// Scaling-path create: same bookkeeping as growth but the sandbox
    /// lands warm and unused.
    async fn create_warm(&self) -> bool {
        match self.driver.create(&self.spec).await {
            Ok(sandbox) => {
                let id = sandbox.id().to_string();
                let now = Instant::now();
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                inner.live.insert(
                    id.clone(),
                    SandboxEntry {
                        sandbox: sandbox.clone(),
                        created_at: now,
                        last_used: now,
                        use_count: 0,
                        status: SandboxStatus::Warm,
                    },
                );
                match self.warm_tx.try_send(id.clone()) {
                    Ok(()) => true,
                    Err(_) => {
                        inner.live.remove(&id);
                        drop(inner);
                        destroy_detached(sandbox);
                        false
                    }
                }
            }
            Err(e) => {
                self.inner.lock().await.creating -= 1;
                warn!(runtime = %self.runtime, error = %e, "failed to pre-warm sandbox");
                false
            }
        }
    }
}

/// Destroys a sandbox on its own task; errors are logged, never surfaced.
fn destroy_detached(sandbox: DynSandbox) {
    tokio::spawn(async move {
        if let Err(e) = sandbox.destroy().await {
            warn!(sandbox_id = %sandbox.id(), error = %e, "failed to destroy sandbox");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverResult, ExecOutcome, ExecOutput, Sandbox};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubSandbox {
        id: String,
        healthy: Arc<AtomicBool>,
        destroys: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Sandbox for StubSandbox {
        fn id(&self) -> &str {
            &self.id
        }

        fn runtime(&self) -> RuntimeClass {
            RuntimeClass::Python311
        }

        async fn exec(&self, _envelope: &[u8], _deadline: Duration) -> DriverResult<ExecOutput> {
            Ok(ExecOutput {
                outcome: ExecOutcome::Ok,
                stdout: "{}".to_string(),
                stderr: String::new(),
            })
        }

        async fn health_ping(&self, _deadline: Duration) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self) -> DriverResult<()> {
            self.destroys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct StubDriver {
        counter: AtomicUsize,
        creates: AtomicUsize,
        fail: AtomicBool,
        healthy: Arc<AtomicBool>,
        destroys: Arc<AtomicUsize>,
    }

    impl StubDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
                creates: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                healthy: Arc::new(AtomicBool::new(true)),
                destroys: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl SandboxDriver for Arc<StubDriver> {
        async fn create(&self, _spec: &SandboxSpec) -> DriverResult<DynSandbox> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DriverError::CreateFailed("stub refused".to_string()));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubSandbox {
                id: format!("stub-{n}"),
                healthy: Arc::clone(&self.healthy),
                destroys: Arc::clone(&self.destroys),
            }))
        }

        async fn reap_stale(&self) -> DriverResult<usize> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    fn pool(driver: &Arc<StubDriver>, limits: PoolLimits) -> RuntimePool {
        let spec = SandboxSpec {
            runtime: RuntimeClass::Python311,
            image: "stub-image".to_string(),
            memory_mb: 512,
            vcpus: 1,
            mounts: Vec::new(),
        };
        RuntimePool::new(spec, limits, std::sync::Arc::new(Arc::clone(driver)))
    }

    fn limits(min_warm: usize, target_warm: usize, max_total: usize) -> PoolLimits {
        PoolLimits {
            min_warm,
            target_warm,
            max_total,
            max_invocations: 100,
            max_sandbox_age: Duration::from_secs(3600),
            scale_up_factor: 1.0,
        }
    }

    #[tokio::test]
    async fn stale_channel_ids_are_skipped_on_acquire() {
        let driver = StubDriver::new();
        let pool = pool(&driver, limits(0, 1, 2));

        // Warm one sandbox, then let a health sweep retire it while its id
        // still sits in the warm channel.
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(lease, true).await;
        driver.healthy.store(false, Ordering::SeqCst);
        assert_eq!(pool.sweep_unhealthy(Duration::from_millis(50)).await, 1);

        driver.healthy.store(true, Ordering::SeqCst);
        let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(lease.cold_start, "the stale warm id must not be handed out");
        assert_eq!(driver.creates.load(Ordering::SeqCst), 2);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn growth_failure_releases_the_creating_slot() {
        let driver = StubDriver::new();
        let pool = pool(&driver, limits(0, 1, 1));

        driver.fail.store(true, Ordering::SeqCst);
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, PoolError::Driver(_)));

        // The failed attempt must not leak capacity.
        driver.fail.store(false, Ordering::SeqCst);
        let lease = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert!(lease.cold_start);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn scale_up_respects_remaining_capacity() {
        let driver = StubDriver::new();
        let pool = pool(&driver, limits(2, 2, 2));

        let busy = pool.acquire(Duration::from_secs(1)).await.unwrap();
        // One slot taken by the busy sandbox; only one warm fits.
        assert_eq!(pool.scale_up().await, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.warm, 1);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.total, 2);
        pool.release(busy, true).await;
    }

    #[tokio::test]
    async fn scale_up_factor_caps_each_tick() {
        let driver = StubDriver::new();
        let mut limits = limits(4, 4, 8);
        limits.scale_up_factor = 0.5;
        let pool = pool(&driver, limits);

        // Deficit is 4; a 0.5 factor creates ceil(4 * 0.5) = 2 per sweep.
        assert_eq!(pool.scale_up().await, 2);
        assert_eq!(pool.stats().await.warm, 2);
        assert_eq!(pool.scale_up().await, 1);
        assert_eq!(pool.scale_up().await, 1);
        assert_eq!(pool.stats().await.warm, 4);
        assert_eq!(pool.scale_up().await, 0);
    }

    #[tokio::test]
    async fn stats_count_by_status_under_the_lock() {
        let driver = StubDriver::new();
        let pool = pool(&driver, limits(0, 2, 4));

        let a = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(Duration::from_secs(1)).await.unwrap();
        pool.release(a, true).await;

        let stats = pool.stats().await;
        assert_eq!(stats.warm, 1);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.max, 4);
        pool.release(b, true).await;
    }
}
