//! Function definitions and validation.
//!
//! A [`Function`] is the immutable input to the dispatcher: identity, runtime
//! class, handler symbol, code (source or pre-compiled binary), environment
//! bindings, resource caps, and optional [`Layer`] references. Validation
//! enforces the platform's resource bounds before any sandbox is touched.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest memory cap a function may request, in MB.
pub const MIN_MEMORY_MB: u32 = 128;

/// Largest memory cap a function may request, in MB.
pub const MAX_MEMORY_MB: u32 = 3072;

/// Largest wall-clock timeout a function may request, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 300;

/// Timeout applied when a function requests `timeout_sec = 0`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors raised by [`Function::validate`].
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("unsupported runtime class: {0}")]
    UnknownRuntime(String),

    #[error("memory_mb {0} out of range ({MIN_MEMORY_MB}..={MAX_MEMORY_MB})")]
    MemoryOutOfRange(u32),

    #[error("timeout_sec {0} out of range (1..={MAX_TIMEOUT_SECS})")]
    TimeoutOutOfRange(u64),

    #[error("function has neither source code nor a binary")]
    NoCode,

    #[error("layer {layer} is not compatible with runtime {runtime}")]
    IncompatibleLayer { layer: String, runtime: RuntimeClass },
}

/// Language/version identifier tying a function to a sandbox image and
/// entrypoint binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeClass {
    #[serde(rename = "python3.11")]
    Python311,
    #[serde(rename = "nodejs20")]
    NodeJs20,
    #[serde(rename = "go1.24")]
    Go124,
}

impl RuntimeClass {
    /// All runtime classes the platform ships images for.
    pub const ALL: [RuntimeClass; 3] =
        [RuntimeClass::Python311, RuntimeClass::NodeJs20, RuntimeClass::Go124];

    /// Canonical string form, as used in configuration and labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeClass::Python311 => "python3.11",
            RuntimeClass::NodeJs20 => "nodejs20",
            RuntimeClass::Go124 => "go1.24",
        }
    }

    /// Default sandbox image for this runtime.
    ///
    /// Overridable per runtime via `[runtimes.<class>] image` in the
    /// configuration file.
    pub fn default_image(&self) -> &'static str {
        match self {
            RuntimeClass::Python311 => "nimbus/runtime-python:3.11",
            RuntimeClass::NodeJs20 => "nimbus/runtime-node:20",
            RuntimeClass::Go124 => "nimbus/runtime-go:1.24",
        }
    }

    /// The in-sandbox entrypoint process for a single invocation.
    ///
    /// The entrypoint reads the invocation envelope on stdin, dispatches to
    /// the handler, and writes the result as JSON on stdout.
    pub fn entrypoint(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            RuntimeClass::Python311 => &["python3", "/var/runtime/bootstrap.py"],
            RuntimeClass::NodeJs20 => &["node", "/var/runtime/bootstrap.js"],
            RuntimeClass::Go124 => &["/var/runtime/bootstrap"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Name of the search-path environment variable layer contributions are
    /// joined into for this runtime.
    pub fn layer_path_var(&self) -> &'static str {
        match self {
            RuntimeClass::Python311 => "PYTHONPATH",
            RuntimeClass::NodeJs20 => "NODE_PATH",
            RuntimeClass::Go124 => "NIMBUS_LAYER_PATH",
        }
    }
}

impl fmt::Display for RuntimeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeClass {
    type Err = FunctionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python3.11" => Ok(RuntimeClass::Python311),
            "nodejs20" => Ok(RuntimeClass::NodeJs20),
            "go1.24" => Ok(RuntimeClass::Go124),
            other => Err(FunctionError::UnknownRuntime(other.to_string())),
        }
    }
}

/// A versioned zip of auxiliary files bind-mounted read-only into sandboxes
/// that reference it.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Stable layer identity.
    pub id: String,
    /// Monotonic version; a new upload of the same id bumps this.
    pub version: u32,
    /// Zip archive bytes.
    pub content: Vec<u8>,
    /// Runtime classes this layer may be attached to. Empty means any.
    pub compatible_runtimes: Vec<RuntimeClass>,
}

impl Layer {
    pub fn compatible_with(&self, runtime: RuntimeClass) -> bool {
        self.compatible_runtimes.is_empty() || self.compatible_runtimes.contains(&runtime)
    }
}

/// A function definition, immutable for the duration of one invocation.
#[derive(Debug, Clone)]
pub struct Function {
    /// Registry-assigned identity.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Runtime class the function executes under.
    pub runtime: RuntimeClass,
    /// Handler symbol the runtime entrypoint dispatches to
    /// (e.g. `main.handler`).
    pub handler: String,
    /// Source code, for interpreted runtimes.
    pub code: String,
    /// Pre-compiled binary blob, for compiled runtimes. Takes precedence
    /// over `code` when non-empty.
    pub binary: Vec<u8>,
    /// Environment bindings injected into the invocation envelope.
    pub env: HashMap<String, String>,
    /// Memory cap in MB. Must be within
    /// [`MIN_MEMORY_MB`]..=[`MAX_MEMORY_MB`].
    pub memory_mb: u32,
    /// Wall-clock timeout in seconds. `0` means [`DEFAULT_TIMEOUT_SECS`].
    pub timeout_sec: u64,
    /// Ordered layer references, applied in declaration order.
    pub layers: Vec<Layer>,
}

impl Function {
    /// Creates a function with the platform defaults (512 MB, 30 s, no env,
    /// no layers). Callers fill in the rest with the setters below.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        runtime: RuntimeClass,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            runtime,
            handler: handler.into(),
            code: String::new(),
            binary: Vec::new(),
            env: HashMap::new(),
            memory_mb: 512,
            timeout_sec: DEFAULT_TIMEOUT_SECS,
            layers: Vec::new(),
        }
    }

    /// Sets the source code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Sets the pre-compiled binary blob.
    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = binary;
        self
    }

    /// Sets the memory cap in MB.
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Sets the wall-clock timeout in seconds.
    pub fn with_timeout_sec(mut self, timeout_sec: u64) -> Self {
        self.timeout_sec = timeout_sec;
        self
    }

    /// Adds an environment binding.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attaches a layer.
    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    /// The deadline applied to a single invocation of this function.
    ///
    /// A requested timeout of `0` falls back to [`DEFAULT_TIMEOUT_SECS`].
    pub fn deadline(&self) -> Duration {
        let secs = if self.timeout_sec == 0 { DEFAULT_TIMEOUT_SECS } else { self.timeout_sec };
        Duration::from_secs(secs)
    }

    /// Validates resource bounds, code presence, and layer compatibility.
    pub fn validate(&self) -> Result<(), FunctionError> {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(FunctionError::MemoryOutOfRange(self.memory_mb));
        }
        if self.timeout_sec > MAX_TIMEOUT_SECS {
            return Err(FunctionError::TimeoutOutOfRange(self.timeout_sec));
        }
        if self.code.is_empty() && self.binary.is_empty() {
            return Err(FunctionError::NoCode);
        }
        for layer in &self.layers {
            if !layer.compatible_with(self.runtime) {
                return Err(FunctionError::IncompatibleLayer {
                    layer: layer.id.clone(),
                    runtime: self.runtime,
                });
            }
        }
        Ok(())
    }
}
