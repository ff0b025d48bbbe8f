//! # nimbus-core
//!
//! The execution core of the Nimbus function-as-a-service platform: it maps
//! incoming function invocations onto isolated sandboxes (containers or
//! micro-VMs), amortizing sandbox startup cost with a warm reservoir per
//! runtime class while enforcing per-invocation isolation, resource caps,
//! timeouts, and recycling policy.
//!
//! ## Architecture
//!
//! The crate is organized into three tightly coupled subsystems plus their
//! shared leaves:
//!
//! ### Drivers ([`driver`])
//!
//! A uniform sandbox capability set with two interchangeable
//! implementations behind the [`SandboxDriver`] / [`Sandbox`] traits:
//!
//! - [`driver::container::ContainerDriver`] - long-lived Docker containers
//!   with exec-per-invocation
//! - [`driver::microvm::MicroVmDriver`] - Firecracker micro-VMs with a
//!   vsock agent and optional snapshot/restore
//!
//! ### Sandbox pool ([`pool`])
//!
//! Per-runtime reservoirs of warm sandboxes with acquire/release,
//! warm/cold accounting, and the lifecycle governor (health, scaling, and
//! metrics workers plus the startup reaper):
//!
//! - [`pool::SandboxPool`] - registry keyed by (runtime class, memory cap)
//! - [`pool::RuntimePool`] - one bounded warm reservoir
//! - [`pool::Governor`] - the background workers
//!
//! ### Dispatcher ([`dispatcher`])
//!
//! The public API: [`Dispatcher::execute`] binds one invocation to one
//! sandbox, streams the stdin envelope in, recovers a JSON body from
//! stdout, classifies the outcome (200 / 504 / 500), and records billed
//! time and the cold-start flag.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use nimbus_core::config::load_config;
//! use nimbus_core::dispatcher::Dispatcher;
//! use nimbus_core::driver::container::ContainerDriver;
//! use nimbus_core::function::{Function, RuntimeClass};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("nimbus.toml"))?;
//!     let driver = Arc::new(ContainerDriver::new(config.container.clone())?);
//!     let dispatcher = Dispatcher::new(config, driver).await;
//!
//!     let function = Function::new("fn-1", "echo", RuntimeClass::Python311, "main.handler")
//!         .with_code("def handler(event, context):\n    return event\n");
//!
//!     let result = dispatcher.execute(&function, serde_json::json!({"x": 1})).await?;
//!     println!("{} in {} ms (billed {})", result.status_code, result.duration_ms, result.billed_time_ms);
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The core is configured via TOML; see the [`config`] module for the
//! schema. The HTTP surface, authentication, the function registry, and
//! sandbox image construction live outside this crate.

pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod function;
pub mod layer;
pub mod pool;
pub mod registry;

// Re-export the types most consumers need.

pub use config::{Config, load_config, load_config_str};
pub use dispatcher::{DispatchError, Dispatcher, InvocationResult};
pub use driver::{DynSandbox, ExecOutcome, Sandbox, SandboxDriver};
pub use function::{Function, Layer, RuntimeClass};
pub use pool::{PoolStats, SandboxPool};
pub use registry::{FunctionRegistry, InvocationRecord, InvocationSink};
