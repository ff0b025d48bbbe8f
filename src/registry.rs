//! External contracts the core consumes but does not own.
//!
//! The function registry (metadata store) and invocation history live
//! outside the execution core. The core only needs a lookup that resolves a
//! [`Function`] and a writer for per-invocation records; both are opaque
//! behind these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::function::Function;

/// Resolves function definitions by id or name.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    /// Looks a function up by registry id or by name.
    async fn lookup(&self, id_or_name: &str) -> anyhow::Result<Option<Function>>;
}

/// One row of invocation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub request_id: String,
    pub function_id: String,
    pub status_code: u16,
    pub duration_ms: u64,
    pub billed_time_ms: u64,
    pub cold_start: bool,
    pub started_at: DateTime<Utc>,
    /// Error string as surfaced to the caller; empty on success.
    #[serde(default)]
    pub error: String,
}

/// Receives invocation records after each invocation completes.
///
/// Implementations must not fail the invocation: log and swallow storage
/// errors internally.
#[async_trait]
pub trait InvocationSink: Send + Sync {
    async fn record(&self, record: &InvocationRecord);
}

/// A sink that drops records (the default when no history store is wired).
pub struct NullInvocationSink;

#[async_trait]
impl InvocationSink for NullInvocationSink {
    async fn record(&self, _record: &InvocationRecord) {}
}
