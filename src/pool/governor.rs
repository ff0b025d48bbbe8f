//! Lifecycle governor: the pool's background workers.
//!
//! Three cooperative periodic tasks run per [`SandboxPool`]:
//!
//! - **health worker** - probes warm sandboxes and evicts failures and
//!   over-aged ones
//! - **scaling worker** - pre-warms replacements up to each pool's target
//! - **metrics worker** - emits per-runtime gauges to the metrics sink
//!
//! Before any worker runs, the startup reaper force-destroys sandboxes left
//! behind by a prior process instance. A failure in any single sweep is
//! logged and never halts the governor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runtime::PoolStats;
use super::SandboxPool;
use crate::config::PoolSettings;

/// Deadline for a single health probe.
const PING_DEADLINE: Duration = Duration::from_secs(2);

/// Receives per-runtime pool gauges once per metrics interval.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn pool_gauges(&self, runtime: &str, stats: &PoolStats);
}

/// A sink that drops gauges (for tests or metrics-less deployments).
pub struct NullMetricsSink;

#[async_trait]
impl MetricsSink for NullMetricsSink {
    async fn pool_gauges(&self, _runtime: &str, _stats: &PoolStats) {}
}

/// A sink that emits gauges as structured log events.
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn pool_gauges(&self, runtime: &str, stats: &PoolStats) {
        debug!(
            runtime,
            warm = stats.warm,
            busy = stats.busy,
            total = stats.total,
            max = stats.max,
            "pool gauges"
        );
    }
}

/// Handle to the running workers. Dropping without [`Governor::shutdown`]
/// aborts nothing; call shutdown to stop the workers and drain the pool.
pub struct Governor {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    pool: Arc<SandboxPool>,
}

impl Governor {
    /// Runs the startup reaper, then spawns the three workers.
    pub async fn start(
        pool: Arc<SandboxPool>,
        settings: &PoolSettings,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        match pool.driver().reap_stale().await {
            Ok(0) => {}
            Ok(count) => info!(count, "startup reaper removed stale sandboxes"),
            Err(e) => warn!(error = %e, "startup reaper failed; continuing"),
        }

        let token = CancellationToken::new();
        let handles = vec![
            spawn_worker(
                token.clone(),
                settings.health_check_interval(),
                Arc::clone(&pool),
                |pool| async move {
                    for runtime_pool in pool.pools().await {
                        let evicted = runtime_pool.sweep_unhealthy(PING_DEADLINE).await;
                        if evicted > 0 {
                            debug!(runtime = %runtime_pool.runtime(), evicted, "health sweep");
                        }
                    }
                },
            ),
            spawn_worker(
                token.clone(),
                settings.scale_check_interval(),
                Arc::clone(&pool),
                |pool| async move {
                    for runtime_pool in pool.pools().await {
                        let created = runtime_pool.scale_up().await;
                        if created > 0 {
                            debug!(runtime = %runtime_pool.runtime(), created, "scaling sweep");
                        }
                    }
                },
            ),
            spawn_worker(
                token.clone(),
                settings.metrics_interval(),
                Arc::clone(&pool),
                move |pool| {
                    let sink = Arc::clone(&sink);
                    async move {
                        for (runtime, stats) in pool.stats().await {
                            sink.pool_gauges(&runtime, &stats).await;
                        }
                    }
                },
            ),
        ];

        Self { token, handles, pool }
    }

    /// Stops the workers, waits for them, and destroys every live sandbox.
    ///
    /// Busy sandboxes are destroyed too; their in-flight invocations
    /// surface as driver errors the dispatcher classifies as 500.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        self.pool.drain_all().await;
        info!("governor stopped");
    }
}

fn spawn_worker<F, Fut>(
    token: CancellationToken,
    period: Duration,
    pool: Arc<SandboxPool>,
    mut sweep: F,
) -> JoinHandle<()>
where
    F: FnMut(Arc<SandboxPool>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => sweep(Arc::clone(&pool)).await,
            }
        }
    })
}
