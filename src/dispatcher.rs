//! Invocation dispatcher: binds invocations to sandboxes and classifies
//! outcomes.
//!
//! The dispatcher is the public API of the execution core. For each
//! invocation it validates the function, prepares any layers, assembles the
//! stdin envelope, borrows a sandbox (from the warm pool, or one-off when
//! pooling is off), enforces the per-invocation deadline, recovers a JSON
//! body from stdout, and bills wall-clock time rounded up to 100 ms.
//!
//! # Execution flow
//!
//! ```text
//!   execute(function, payload)
//!        │ validate ─► DispatchError::Invalid (sync, nothing allocated)
//!        │ layers   ─► extract-or-reuse cache, mounts + env
//!        ▼
//!   SandboxPool::acquire ──► Sandbox::exec(envelope, deadline)
//!        │                        │
//!        │   outcome=ok        ─► 200, body from stdout, release healthy
//!        │   outcome=error     ─► 500, release healthy (user fault)
//!        │   outcome=timeout   ─► 504, release unhealthy (retired)
//!        ▼
//!   InvocationResult { status, body, billed_time_ms, cold_start, ... }
//! ```
//!
//! The dispatcher never panics into the caller: every driver or user
//! failure becomes an [`InvocationResult`] with a textual error. The only
//! `Err` returns are validation/configuration problems and capacity
//! exhaustion, both of which occur before a sandbox is touched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::driver::{DriverError, ExecOutcome, ExecOutput, SandboxDriver, SandboxSpec};
use crate::function::{Function, FunctionError, Layer};
use crate::layer::{LayerCache, LayerError, PreparedLayers};
use crate::pool::{
    Governor, LogMetricsSink, MetricsSink, PoolError, PoolStats, SandboxPool,
};
use crate::registry::{InvocationRecord, InvocationSink, NullInvocationSink};

/// Longest error string surfaced to callers, in bytes.
const MAX_ERROR_BYTES: usize = 512;

/// Billing granularity: wall-clock time is rounded up to this many ms.
const BILLING_GRANULARITY_MS: u64 = 100;

/// Errors surfaced synchronously from [`Dispatcher::execute`], before any
/// sandbox is allocated. Everything else becomes an [`InvocationResult`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Invalid(#[from] FunctionError),

    #[error(transparent)]
    Layer(#[from] LayerError),

    /// No sandbox became available within the acquire timeout. The layer
    /// above maps this to a 503; retrying is the caller's call.
    #[error("no sandbox capacity available: {0}")]
    CapacityExhausted(#[from] PoolError),
}

/// The result of one invocation, surfaced to callers in every non-config
/// failure case.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResult {
    pub request_id: String,
    /// 200 on success, 504 on deadline, 500 on any other failure.
    pub status_code: u16,
    /// Parsed function output; `null` on failure.
    pub body: Value,
    /// Populated only on non-2xx, truncated to a bounded length.
    pub error: String,
    pub duration_ms: u64,
    /// `duration_ms` rounded up to the next 100 ms.
    pub billed_time_ms: u64,
    pub cold_start: bool,
}

/// The JSON document streamed to the sandbox entrypoint on stdin.
#[derive(Serialize)]
struct Envelope<'a> {
    handler: &'a str,
    code: String,
    payload: &'a Value,
    env: &'a HashMap<String, String>,
}

/// Public entry point of the execution core.
pub struct Dispatcher {
    driver: Arc<dyn SandboxDriver>,
    pool: Option<Arc<SandboxPool>>,
    governor: Mutex<Option<Governor>>,
    layer_cache: LayerCache,
    config: Config,
    sink: Arc<dyn InvocationSink>,
}

impl Dispatcher {
    /// Builds a dispatcher with log-based metrics and no invocation
    /// history sink.
    pub async fn new(config: Config, driver: Arc<dyn SandboxDriver>) -> Self {
        Self::with_sinks(config, driver, Arc::new(LogMetricsSink), Arc::new(NullInvocationSink))
            .await
    }

    /// Builds a dispatcher with explicit metrics and invocation sinks.
    ///
    /// When pooling is enabled (and the driver supports it) this starts
    /// the sandbox pool's governor, including the startup reaper.
    pub async fn with_sinks(
        config: Config,
        driver: Arc<dyn SandboxDriver>,
        metrics: Arc<dyn MetricsSink>,
        sink: Arc<dyn InvocationSink>,
    ) -> Self {
        let layer_cache = LayerCache::new(&config.container.layer_cache_dir);

        let (pool, governor) = if config.pool.enabled && driver.pooling_supported() {
            let pool = Arc::new(SandboxPool::new(Arc::clone(&driver), config.clone()));
            let governor = Governor::start(Arc::clone(&pool), &config.pool, metrics).await;
            (Some(pool), Some(governor))
        } else {
            debug!(driver = driver.name(), "pooling disabled; dispatching one-off sandboxes");
            (None, None)
        };

        Self { driver, pool, governor: Mutex::new(governor), layer_cache, config, sink }
    }

    /// Executes a function against a payload.
    ///
    /// Layers referenced by the function itself are honored; see
    /// [`execute_with_layers`](Self::execute_with_layers) to attach more.
    pub async fn execute(
        &self,
        function: &Function,
        payload: Value,
    ) -> Result<InvocationResult, DispatchError> {
        self.execute_with_layers(function, payload, &[]).await
    }

    /// Executes a function with additional layers attached for this
    /// invocation only.
    pub async fn execute_with_layers(
        &self,
        function: &Function,
        payload: Value,
        extra_layers: &[Layer],
    ) -> Result<InvocationResult, DispatchError> {
        function.validate()?;
        for layer in extra_layers {
            if !layer.compatible_with(function.runtime) {
                return Err(FunctionError::IncompatibleLayer {
                    layer: layer.id.clone(),
                    runtime: function.runtime,
                }
                .into());
            }
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let start = Instant::now();

        let prepared = self.prepare_layers(function, extra_layers).await?;
        let envelope = build_envelope(function, &payload, &prepared);

        let mut result = if let Some(pool) = &self.pool {
            self.execute_pooled(pool, function, &envelope, &request_id, start).await?
        } else {
            self.execute_one_off(function, &envelope, &prepared, &request_id, start).await
        };
        result.billed_time_ms = billed_ms(result.duration_ms);

        self.sink
            .record(&InvocationRecord {
                request_id: result.request_id.clone(),
                function_id: function.id.clone(),
                status_code: result.status_code,
                duration_ms: result.duration_ms,
                billed_time_ms: result.billed_time_ms,
                cold_start: result.cold_start,
                started_at,
                error: result.error.clone(),
            })
            .await;

        Ok(result)
    }

    /// Per-runtime pool gauges: `{runtime -> {warm, busy, total, max}}`.
    /// Empty when pooling is disabled.
    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        match &self.pool {
            Some(pool) => pool.stats().await,
            None => HashMap::new(),
        }
    }

    /// Stops the governor and destroys every pooled sandbox. Idempotent.
    pub async fn shutdown(&self) {
        if let Some(governor) = self.governor.lock().await.take() {
            governor.shutdown().await;
        }
    }

    async fn prepare_layers(
        &self,
        function: &Function,
        extra_layers: &[Layer],
    ) -> Result<PreparedLayers, DispatchError> {
        if function.layers.is_empty() && extra_layers.is_empty() {
            return Ok(PreparedLayers::default());
        }
        let cache = self.layer_cache.clone();
        let runtime = function.runtime;
        let mut layers = function.layers.clone();
        layers.extend_from_slice(extra_layers);
        // Extraction is filesystem-heavy; keep it off the async workers.
        let prepared = tokio::task::spawn_blocking(move || cache.prepare(runtime, &layers))
            .await
            .map_err(|e| LayerError::Io(std::io::Error::other(e)))??;
        Ok(prepared)
    }

    async fn execute_pooled(
        &self,
        pool: &Arc<SandboxPool>,
        function: &Function,
        envelope: &[u8],
        request_id: &str,
        start: Instant,
    ) -> Result<InvocationResult, DispatchError> {
        let runtime_pool = pool.pool_for(function.runtime, function.memory_mb).await;
        let lease = match runtime_pool.acquire(self.config.pool.acquire_timeout()).await {
            Ok(lease) => lease,
            Err(PoolError::Driver(e)) => {
                // A failed cold-start attempt; the pool stays clean.
                return Ok(failure_result(request_id, 500, &e.to_string(), start, true));
            }
            Err(e) => return Err(DispatchError::CapacityExhausted(e)),
        };
        let cold_start = lease.cold_start;

        debug!(
            request_id,
            sandbox_id = lease.sandbox_id(),
            function = %function.name,
            cold_start,
            "dispatching invocation"
        );

        let exec = lease.sandbox.exec(envelope, function.deadline()).await;
        let (result, healthy) = classify(exec, request_id, start, cold_start);
        runtime_pool.release(lease, healthy).await;
        Ok(result)
    }

    async fn execute_one_off(
        &self,
        function: &Function,
        envelope: &[u8],
        prepared: &PreparedLayers,
        request_id: &str,
        start: Instant,
    ) -> InvocationResult {
        let template = self.config.runtime_template(function.runtime);
        let spec = SandboxSpec {
            runtime: function.runtime,
            image: self.config.runtime_image(function.runtime),
            memory_mb: function.memory_mb,
            vcpus: template.vcpus,
            mounts: prepared.mounts.clone(),
        };

        let sandbox = match self.driver.create(&spec).await {
            Ok(sandbox) => sandbox,
            Err(e) => return failure_result(request_id, 500, &e.to_string(), start, true),
        };

        let exec = sandbox.exec(envelope, function.deadline()).await;
        // One-off sandboxes never outlive their invocation.
        if let Err(e) = sandbox.destroy().await {
            warn!(sandbox_id = sandbox.id(), error = %e, "failed to destroy one-off sandbox");
        }

        let (result, _healthy) = classify(exec, request_id, start, true);
        result
    }
}

/// Assembles the stdin envelope: handler, code (binary blob wins over
/// source), payload, and the function env merged with layer search paths.
fn build_envelope(function: &Function, payload: &Value, prepared: &PreparedLayers) -> Vec<u8> {
    let mut env = function.env.clone();
    for (key, joined) in &prepared.env {
        match env.get_mut(key) {
            Some(existing) => *existing = format!("{joined}:{existing}"),
            None => {
                env.insert(key.clone(), joined.clone());
            }
        }
    }

    let code = if !function.binary.is_empty() {
        base64::engine::general_purpose::STANDARD.encode(&function.binary)
    } else {
        function.code.clone()
    };

    let envelope = Envelope { handler: &function.handler, code, payload, env: &env };
    // Envelope serialization cannot fail: every field is already JSON-safe.
    serde_json::to_vec(&envelope).expect("envelope is serializable")
}

/// Turns a driver exec result into an invocation result plus the
/// release-health verdict.
fn classify(
    exec: Result<ExecOutput, DriverError>,
    request_id: &str,
    start: Instant,
    cold_start: bool,
) -> (InvocationResult, bool) {
    match exec {
        Ok(output) => match output.outcome {
            ExecOutcome::Ok => {
                let result = InvocationResult {
                    request_id: request_id.to_string(),
                    status_code: 200,
                    body: parse_output(&output.stdout),
                    error: String::new(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    billed_time_ms: 0,
                    cold_start,
                };
                (result, true)
            }
            ExecOutcome::Timeout => {
                // Residual processes may linger; retire the sandbox.
                let result =
                    failure_result(request_id, 504, "function timed out", start, cold_start);
                (result, false)
            }
            ExecOutcome::RuntimeError => {
                // User code fault; the sandbox itself is fine.
                let error = error_snippet(&output.stderr, &output.stdout, "function failed");
                let result = failure_result(request_id, 500, &error, start, cold_start);
                (result, true)
            }
        },
        Err(e) => {
            let result = failure_result(request_id, 500, &e.to_string(), start, cold_start);
            (result, false)
        }
    }
}

fn failure_result(
    request_id: &str,
    status_code: u16,
    error: &str,
    start: Instant,
    cold_start: bool,
) -> InvocationResult {
    InvocationResult {
        request_id: request_id.to_string(),
        status_code,
        body: Value::Null,
        error: truncate(error),
        duration_ms: start.elapsed().as_millis() as u64,
        billed_time_ms: 0,
        cold_start,
    }
}

/// Recovers a JSON body from raw stdout.
///
/// Tolerates user code that prints logs before the result: whole-stdout
/// JSON wins, then the last non-empty line that parses as JSON, and
/// anything else is wrapped as `{"output": <text>}`.
fn parse_output(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return value;
    }
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(line) {
            return value;
        }
    }
    serde_json::json!({ "output": trimmed })
}

/// Most-relevant failure stream: stderr first, then stdout, then the
/// driver's own message.
fn error_snippet(stderr: &str, stdout: &str, fallback: &str) -> String {
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return truncate(stderr);
    }
    let stdout = stdout.trim();
    if !stdout.is_empty() {
        return truncate(stdout);
    }
    truncate(fallback)
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_ERROR_BYTES {
        return s.to_string();
    }
    let mut end = MAX_ERROR_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

fn billed_ms(duration_ms: u64) -> u64 {
    duration_ms.div_ceil(BILLING_GRANULARITY_MS) * BILLING_GRANULARITY_MS
}
