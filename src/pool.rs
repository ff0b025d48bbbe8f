//! Sandbox pool: a registry of per-runtime reservoirs plus the background
//! workers that keep them healthy.
//!
//! ```text
//!   Dispatcher ──► SandboxPool ──► RuntimePool (python3.11, 512MB)
//!                      │      └──► RuntimePool (nodejs20, 512MB)
//!                      │               ...
//!                      └── Governor: health / scaling / metrics workers
//! ```
//!
//! Runtime pools are created lazily on first acquire for an unseen
//! (runtime class, memory cap) pair. Pool sizing is immutable once a
//! runtime pool exists.

pub mod governor;
pub mod runtime;

pub use governor::{Governor, LogMetricsSink, MetricsSink, NullMetricsSink};
pub use runtime::{Lease, PoolError, PoolLimits, PoolStats, RuntimePool, SandboxStatus};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::driver::{SandboxDriver, SandboxSpec};
use crate::function::RuntimeClass;

/// Registry of [`RuntimePool`]s keyed by (runtime class, memory cap).
pub struct SandboxPool {
    driver: Arc<dyn SandboxDriver>,
    config: Config,
    pools: Mutex<HashMap<(RuntimeClass, u32), Arc<RuntimePool>>>,
}

impl SandboxPool {
    pub fn new(driver: Arc<dyn SandboxDriver>, config: Config) -> Self {
        Self { driver, config, pools: Mutex::new(HashMap::new()) }
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    /// Returns the runtime pool for a (runtime, memory) pair, instantiating
    /// it from the runtime's configured template on first use.
    pub async fn pool_for(&self, runtime: RuntimeClass, memory_mb: u32) -> Arc<RuntimePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(&(runtime, memory_mb)) {
            return Arc::clone(pool);
        }

        let template = self.config.runtime_template(runtime);
        let spec = SandboxSpec {
            runtime,
            image: self.config.runtime_image(runtime),
            memory_mb,
            vcpus: template.vcpus,
            // Pooled sandboxes see the whole layer cache at the fixed guest
            // path; no per-sandbox mounts.
            mounts: Vec::new(),
        };
        let limits = PoolLimits {
            min_warm: template.min_warm,
            target_warm: template.target_warm,
            max_total: template.max_total,
            max_invocations: self.config.pool.max_invocations_per_sandbox,
            max_sandbox_age: self.config.pool.max_sandbox_age(),
            scale_up_factor: template.scale_up_factor,
        };

        debug!(runtime = %runtime, memory_mb, "instantiating runtime pool");
        let pool = Arc::new(RuntimePool::new(spec, limits, Arc::clone(&self.driver)));
        pools.insert((runtime, memory_mb), Arc::clone(&pool));
        pool
    }

    /// Snapshot of every instantiated runtime pool, for the governor's
    /// sweeps.
    pub async fn pools(&self) -> Vec<Arc<RuntimePool>> {
        self.pools.lock().await.values().cloned().collect()
    }

    /// Per-runtime counts, aggregated across memory variants of the same
    /// runtime class.
    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools().await;
        let mut by_runtime: HashMap<String, PoolStats> = HashMap::new();
        for pool in pools {
            let stats = pool.stats().await;
            let entry = by_runtime
                .entry(pool.runtime().to_string())
                .or_insert(PoolStats { warm: 0, busy: 0, total: 0, max: 0 });
            entry.warm += stats.warm;
            entry.busy += stats.busy;
            entry.total += stats.total;
            entry.max += stats.max;
        }
        by_runtime
    }

    /// Destroys every live sandbox in every runtime pool.
    pub async fn drain_all(&self) {
        for pool in self.pools().await {
            pool.drain_all().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverError, DriverResult, DynSandbox, SandboxDriver, SandboxSpec};
    use async_trait::async_trait;

    struct UnreachableDriver;

    #[async_trait]
    impl SandboxDriver for UnreachableDriver {
        async fn create(&self, _spec: &SandboxSpec) -> DriverResult<DynSandbox> {
            Err(DriverError::CreateFailed("not wired in this test".to_string()))
        }

        async fn reap_stale(&self) -> DriverResult<usize> {
            Ok(0)
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    fn pool() -> SandboxPool {
        SandboxPool::new(Arc::new(UnreachableDriver), Config::default())
    }

    #[tokio::test]
    async fn pool_for_is_lazy_and_keyed_by_runtime_and_memory() {
        let registry = pool();
        assert!(registry.pools().await.is_empty());

        let a = registry.pool_for(RuntimeClass::Python311, 512).await;
        let b = registry.pool_for(RuntimeClass::Python311, 512).await;
        let c = registry.pool_for(RuntimeClass::Python311, 1024).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.pools().await.len(), 2);
    }

    #[tokio::test]
    async fn stats_aggregate_memory_variants_per_runtime() {
        let registry = pool();
        registry.pool_for(RuntimeClass::Python311, 512).await;
        registry.pool_for(RuntimeClass::Python311, 1024).await;
        registry.pool_for(RuntimeClass::NodeJs20, 512).await;

        let stats = registry.stats().await;
        assert_eq!(stats.len(), 2);
        // Two python pools at the default max_total of 10 each.
        assert_eq!(stats["python3.11"].max, 20);
        assert_eq!(stats["python3.11"].total, 0);
        assert_eq!(stats["nodejs20"].max, 10);
    }
}
