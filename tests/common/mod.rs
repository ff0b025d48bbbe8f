//! In-process fake driver for pool and dispatcher tests.
//!
//! The fake honors the driver contract (atomic create, deadline-bounded
//! exec, idempotent destroy) without Docker or KVM. Tests program its
//! behavior per-exec and observe create/destroy/exec counts.

// Each test binary uses a different slice of the fake.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use nimbus_core::driver::{
    DriverError, DriverResult, DynSandbox, ExecOutcome, ExecOutput, Sandbox, SandboxDriver,
    SandboxSpec,
};
use nimbus_core::function::RuntimeClass;

/// What a fake sandbox does for one exec: work for `delay`, then produce
/// `output`. If `delay` exceeds the invocation deadline the sandbox
/// produces a `Timeout` outcome instead, like a real driver killing the
/// user process.
pub struct FakeReply {
    pub delay: Duration,
    pub output: ExecOutput,
}

type Behavior = Arc<dyn Fn(&Value) -> FakeReply + Send + Sync>;

/// Echo behavior: the handler returns the invocation payload.
fn echo(envelope: &Value) -> FakeReply {
    FakeReply {
        delay: Duration::ZERO,
        output: ExecOutput {
            outcome: ExecOutcome::Ok,
            stdout: envelope["payload"].to_string(),
            stderr: String::new(),
        },
    }
}

pub struct FakeDriver {
    behavior: Mutex<Behavior>,
    pub created: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub execs: AtomicUsize,
    pub fail_create: AtomicBool,
    /// When set, every health ping fails.
    pub all_unhealthy: AtomicBool,
    /// Specs seen by `create`, for mount/image assertions.
    pub specs: Mutex<Vec<SandboxSpec>>,
    counter: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(Arc::new(echo)),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
            execs: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            all_unhealthy: AtomicBool::new(false),
            specs: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, f: impl Fn(&Value) -> FakeReply + Send + Sync + 'static) {
        *self.behavior.lock().unwrap() = Arc::new(f);
    }

    /// Fixed stdout with an `Ok` outcome and no delay.
    pub fn set_stdout(&self, stdout: &str) {
        let stdout = stdout.to_string();
        self.set_behavior(move |_| FakeReply {
            delay: Duration::ZERO,
            output: ExecOutput {
                outcome: ExecOutcome::Ok,
                stdout: stdout.clone(),
                stderr: String::new(),
            },
        });
    }

    /// Echo behavior after sleeping `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.set_behavior(move |envelope| {
            let mut reply = echo(envelope);
            reply.delay = delay;
            reply
        });
    }
}

/// Orphan-rule-safe wrapper: `SandboxDriver` and `Arc` are both foreign to
/// this test crate, so the impl needs a local type to attach to.
pub struct DriverHandle(pub Arc<FakeDriver>);

#[async_trait]
impl SandboxDriver for DriverHandle {
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<DynSandbox> {
        let driver = &self.0;
        if driver.fail_create.load(Ordering::SeqCst) {
            return Err(DriverError::CreateFailed("fake daemon unavailable".to_string()));
        }
        driver.specs.lock().unwrap().push(spec.clone());
        let n = driver.counter.fetch_add(1, Ordering::SeqCst);
        driver.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSandbox {
            id: format!("fake-{}-{n}", spec.runtime),
            runtime: spec.runtime,
            driver: Arc::clone(driver),
            destroyed: AtomicBool::new(false),
        }))
    }

    async fn reap_stale(&self) -> DriverResult<usize> {
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

pub struct FakeSandbox {
    id: String,
    runtime: RuntimeClass,
    driver: Arc<FakeDriver>,
    destroyed: AtomicBool,
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> RuntimeClass {
        self.runtime
    }

    async fn exec(&self, envelope: &[u8], deadline: Duration) -> DriverResult<ExecOutput> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(DriverError::Interrupted);
        }
        self.driver.execs.fetch_add(1, Ordering::SeqCst);

        let envelope: Value = serde_json::from_slice(envelope)?;
        let reply = {
            let behavior = self.driver.behavior.lock().unwrap();
            behavior(&envelope)
        };

        if reply.delay > deadline {
            tokio::time::sleep(deadline).await;
            return Ok(ExecOutput {
                outcome: ExecOutcome::Timeout,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        tokio::time::sleep(reply.delay).await;
        Ok(reply.output)
    }

    async fn health_ping(&self, _deadline: Duration) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
            && !self.driver.all_unhealthy.load(Ordering::SeqCst)
    }

    async fn destroy(&self) -> DriverResult<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.driver.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
