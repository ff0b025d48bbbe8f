//! Sandbox drivers: a uniform capability set over container runtimes and
//! micro-VM managers.
//!
//! The driver system has two traits:
//!
//! - [`SandboxDriver`] - factory that creates sandboxes and reaps leftovers
//! - [`Sandbox`] - one isolated execution environment
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SandboxDriver                          │
//! │  (creates sandboxes, reaps stale ones at startup)           │
//! │                                                             │
//! │  create(SandboxSpec) ──────────► Sandbox                    │
//! │  reap_stale()                     │                         │
//! └───────────────────────────────────┼─────────────────────────┘
//!                                     │
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                              │
//! │  (one invocation at a time)                                 │
//! │                                                             │
//! │  exec(envelope, deadline) ─────► ExecOutput                 │
//! │  health_ping(deadline)                                      │
//! │  destroy()          [idempotent]                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both implementations honor the same contract: `create` is atomic (partial
//! state is torn down before the error returns), at most one `exec` is in
//! flight per sandbox at a time (enforced by the pool), a `Timeout` outcome
//! means the deadline elapsed and the user process was killed, and `destroy`
//! may be called any number of times.

pub mod container;
pub mod microvm;
pub mod network;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::function::RuntimeClass;

/// Label applied to every sandbox this process creates, so a later process
/// instance can find and reap leftovers.
pub const MANAGED_LABEL_KEY: &str = "nimbus.managed";

/// Value of [`MANAGED_LABEL_KEY`].
pub const MANAGED_LABEL_VALUE: &str = "1";

/// Label carrying the sandbox's runtime class.
pub const RUNTIME_LABEL_KEY: &str = "nimbus.runtime";

/// Guest path under which layer caches are visible.
pub const LAYER_GUEST_ROOT: &str = "/opt/layers";

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur during driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("failed to execute in sandbox: {0}")]
    ExecFailed(String),

    #[error("failed to destroy sandbox: {0}")]
    DestroyFailed(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("sandbox was destroyed while an invocation was in flight")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("driver-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Classification of a single exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The entrypoint ran to completion with exit code 0.
    Ok,
    /// The deadline elapsed; the user process was killed.
    Timeout,
    /// The entrypoint exited non-zero (user code fault).
    RuntimeError,
}

/// Captured output of a single exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub outcome: ExecOutcome,
    /// Everything the entrypoint wrote to stdout.
    pub stdout: String,
    /// Diagnostic stream; never parsed as a result.
    pub stderr: String,
}

impl ExecOutput {
    /// `true` when the invocation produced a usable result.
    pub fn success(&self) -> bool {
        self.outcome == ExecOutcome::Ok
    }
}

/// A read-only bind mount contributed by layer setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerMount {
    /// Extracted layer cache directory on the host.
    pub host_dir: PathBuf,
    /// Where the layer appears inside the sandbox.
    pub guest_dir: PathBuf,
}

/// Everything a driver needs to create one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Runtime class, which selects the image/rootfs and entrypoint.
    pub runtime: RuntimeClass,
    /// Container image. The micro-VM driver derives its rootfs from the
    /// runtime class instead.
    pub image: String,
    /// Memory cap in MB.
    pub memory_mb: u32,
    /// vCPU count.
    pub vcpus: u32,
    /// Per-sandbox layer mounts. Pooled container sandboxes ignore these in
    /// favor of the fixed whole-cache mount; one-off and micro-VM sandboxes
    /// mount each entry individually.
    pub mounts: Vec<LayerMount>,
}

/// An isolated execution environment able to run one invocation at a time.
///
/// The pool guarantees at most one `exec` in flight per sandbox; drivers do
/// not need their own exec serialization.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Driver-assigned identity.
    fn id(&self) -> &str;

    /// Runtime class this sandbox was created for.
    fn runtime(&self) -> RuntimeClass;

    /// Streams the invocation envelope to the runtime entrypoint and
    /// captures its output.
    ///
    /// When `deadline` elapses the driver kills the user process before
    /// returning an [`ExecOutcome::Timeout`] output.
    async fn exec(&self, envelope: &[u8], deadline: Duration) -> DriverResult<ExecOutput>;

    /// Cheap liveness probe, side-effect-free on the sandbox's user state.
    async fn health_ping(&self, deadline: Duration) -> bool;

    /// Tears the sandbox down. Idempotent: destroying an already-destroyed
    /// sandbox is not an error.
    async fn destroy(&self) -> DriverResult<()>;
}

/// A shared handle to a sandbox.
///
/// The pool's live table and an in-flight lease may both hold the handle;
/// the status bookkeeping in the pool decides who is allowed to call `exec`.
pub type DynSandbox = Arc<dyn Sandbox>;

/// A driver creates sandboxes and knows how to find leftovers from a prior
/// process instance.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Creates and starts a sandbox. Atomic: on error no resources remain.
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<DynSandbox>;

    /// Force-destroys sandboxes tagged by a prior process instance
    /// (via [`MANAGED_LABEL_KEY`] or driver-specific on-disk state) and
    /// returns how many were removed. Runs once at pool startup.
    async fn reap_stale(&self) -> DriverResult<usize>;

    /// Whether sandboxes created by this driver survive between execs and
    /// may be pooled. Drivers without a persistent-sandbox notion force the
    /// dispatcher into one-off mode.
    fn pooling_supported(&self) -> bool {
        true
    }

    /// Driver name for logging and stats.
    fn name(&self) -> &'static str;
}
