//! Configuration schema definitions for the execution core.
//!
//! All types here deserialize from TOML. Every field has a default so that a
//! minimal (or empty) configuration file yields a working single-host setup.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── PoolSettings            - Pool-wide knobs (intervals, retirement, timeouts)
//! ├── ContainerDriverConfig   - Container driver (Docker) settings
//! ├── MicroVmDriverConfig     - Micro-VM driver (Firecracker) settings
//! └── runtimes                - Per-runtime-class templates (HashMap<String, RuntimeTemplate>)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for the execution core.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Pool-wide settings shared by every runtime pool.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Container driver settings.
    #[serde(default)]
    pub container: ContainerDriverConfig,

    /// Micro-VM driver settings.
    #[serde(default)]
    pub microvm: MicroVmDriverConfig,

    /// Per-runtime-class resource templates, keyed by the canonical runtime
    /// string (`"python3.11"`, `"nodejs20"`, ...). Runtimes without an entry
    /// use [`RuntimeTemplate::default`].
    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeTemplate>,
}

/// Pool-wide settings shared by every runtime pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Whether warm pooling is enabled at all.
    ///
    /// When disabled the dispatcher creates and destroys a sandbox per
    /// invocation (one-off mode) and every invocation is a cold start.
    #[serde(default = "default_pool_enabled")]
    pub enabled: bool,

    /// Interval between health-worker sweeps, in seconds.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Interval between scaling-worker sweeps, in seconds.
    #[serde(default = "default_scale_interval")]
    pub scale_check_interval_secs: u64,

    /// Interval between metrics emissions, in seconds.
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Sandboxes older than this are retired, in seconds.
    #[serde(default = "default_max_sandbox_age")]
    pub max_sandbox_age_secs: u64,

    /// Sandboxes that have served this many invocations are retired.
    #[serde(default = "default_max_invocations")]
    pub max_invocations_per_sandbox: u32,

    /// How long an invocation waits for pool capacity before giving up,
    /// in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

impl PoolSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn scale_check_interval(&self) -> Duration {
        Duration::from_secs(self.scale_check_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn max_sandbox_age(&self) -> Duration {
        Duration::from_secs(self.max_sandbox_age_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: default_pool_enabled(),
            health_check_interval_secs: default_health_interval(),
            scale_check_interval_secs: default_scale_interval(),
            metrics_interval_secs: default_metrics_interval(),
            max_sandbox_age_secs: default_max_sandbox_age(),
            max_invocations_per_sandbox: default_max_invocations(),
            acquire_timeout_secs: default_acquire_timeout(),
        }
    }
}

fn default_pool_enabled() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

fn default_scale_interval() -> u64 {
    10
}

fn default_metrics_interval() -> u64 {
    1
}

fn default_max_sandbox_age() -> u64 {
    3600 // 1 hour
}

fn default_max_invocations() -> u32 {
    100
}

fn default_acquire_timeout() -> u64 {
    30
}

/// Container driver (Docker) settings.
///
/// # Example
///
/// ```toml
/// [container]
/// network_mode = "none"
/// tmpfs_size_mb = 512
/// layer_cache_dir = "/var/lib/nimbus/layers"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContainerDriverConfig {
    /// Docker daemon endpoint. Defaults to the local socket.
    pub docker_host: Option<String>,

    /// Host directory holding extracted layer caches. Bind-mounted
    /// read-only into every container at the fixed guest path.
    #[serde(default = "default_layer_cache_dir")]
    pub layer_cache_dir: PathBuf,

    /// Size of the writable `/tmp` tmpfs inside each container, in MB.
    #[serde(default = "default_tmpfs_size")]
    pub tmpfs_size_mb: u32,

    /// Docker network mode. The platform default is no network at all.
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Skip memory/CPU caps on container creation.
    ///
    /// Escape hatch for hosts whose cgroup regime rejects resource limits
    /// (e.g. rootless daemons without delegation).
    #[serde(default)]
    pub disable_resource_limits: bool,
}

impl Default for ContainerDriverConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            layer_cache_dir: default_layer_cache_dir(),
            tmpfs_size_mb: default_tmpfs_size(),
            network_mode: default_network_mode(),
            disable_resource_limits: false,
        }
    }
}

fn default_layer_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/nimbus/layers")
}

fn default_tmpfs_size() -> u32 {
    512
}

fn default_network_mode() -> String {
    "none".to_string()
}

/// Micro-VM driver (Firecracker) settings.
///
/// # Example
///
/// ```toml
/// [microvm]
/// kernel_path = "/var/lib/nimbus/images/vmlinux"
/// rootfs_dir = "/var/lib/nimbus/images"
/// use_snapshots = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MicroVmDriverConfig {
    /// Guest kernel image.
    #[serde(default = "default_kernel_path")]
    pub kernel_path: PathBuf,

    /// Directory holding per-runtime rootfs images
    /// (`rootfs-<runtime>.ext4`).
    #[serde(default = "default_rootfs_dir")]
    pub rootfs_dir: PathBuf,

    /// Working directory for per-sandbox state (sockets, disks, snapshots).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Name of the host bridge all TAP devices attach to.
    #[serde(default = "default_bridge_name")]
    pub bridge_name: String,

    /// Private subnet guest IPs are allocated from. The first host address
    /// is the gateway.
    #[serde(default = "default_subnet_cidr")]
    pub subnet_cidr: String,

    /// Accelerate creation by restoring from a per-runtime template
    /// snapshot taken on the first cold boot.
    #[serde(default)]
    pub use_snapshots: bool,

    /// vsock port the in-guest agent listens on.
    #[serde(default = "default_vsock_port")]
    pub vsock_port: u32,
}

impl Default for MicroVmDriverConfig {
    fn default() -> Self {
        Self {
            kernel_path: default_kernel_path(),
            rootfs_dir: default_rootfs_dir(),
            data_dir: default_data_dir(),
            bridge_name: default_bridge_name(),
            subnet_cidr: default_subnet_cidr(),
            use_snapshots: false,
            vsock_port: default_vsock_port(),
        }
    }
}

fn default_kernel_path() -> PathBuf {
    PathBuf::from("/var/lib/nimbus/images/vmlinux")
}

fn default_rootfs_dir() -> PathBuf {
    PathBuf::from("/var/lib/nimbus/images")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/nimbus")
}

fn default_bridge_name() -> String {
    "nimbr0".to_string()
}

fn default_subnet_cidr() -> String {
    "172.30.0.0/24".to_string()
}

fn default_vsock_port() -> u32 {
    5005
}

/// Per-runtime-class resource template.
///
/// Controls both the shape of each sandbox (memory, vCPUs, image) and the
/// pool sizing for the runtime (warm reservoir targets and the hard cap).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeTemplate {
    /// Sandbox image override. `None` uses the runtime's built-in default.
    pub image: Option<String>,

    /// Default memory cap for pool-created sandboxes, in MB.
    #[serde(default = "default_template_memory")]
    pub memory_mb: u32,

    /// vCPUs per sandbox.
    #[serde(default = "default_template_vcpus")]
    pub vcpus: u32,

    /// The scaling worker tops the pool up whenever fewer than this many
    /// warm sandboxes are available.
    #[serde(default)]
    pub min_warm: usize,

    /// Warm count the scaling worker aims for when topping up.
    #[serde(default = "default_target_warm")]
    pub target_warm: usize,

    /// Hard cap on `warm + busy + creating` for this runtime.
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Per-tick cap multiplier for the scaling worker: at most
    /// `ceil(deficit * scale_up_factor)` sandboxes are created per sweep.
    #[serde(default = "default_scale_up")]
    pub scale_up_factor: f64,

    /// Reserved; scale-down is implicit via retirement.
    #[serde(default = "default_scale_down")]
    pub scale_down_factor: f64,
}

impl Default for RuntimeTemplate {
    fn default() -> Self {
        Self {
            image: None,
            memory_mb: default_template_memory(),
            vcpus: default_template_vcpus(),
            min_warm: 0,
            target_warm: default_target_warm(),
            max_total: default_max_total(),
            scale_up_factor: default_scale_up(),
            scale_down_factor: default_scale_down(),
        }
    }
}

fn default_template_memory() -> u32 {
    512
}

fn default_template_vcpus() -> u32 {
    1
}

fn default_target_warm() -> usize {
    1
}

fn default_max_total() -> usize {
    10
}

fn default_scale_up() -> f64 {
    1.0
}

fn default_scale_down() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.pool.enabled);
        assert_eq!(config.pool.max_invocations_per_sandbox, 100);
        assert_eq!(config.container.network_mode, "none");
        assert_eq!(config.microvm.bridge_name, "nimbr0");
        assert!(config.runtimes.is_empty());
    }

    #[test]
    fn runtime_template_section_parses() {
        let toml = r#"
            [pool]
            max_invocations_per_sandbox = 50

            [runtimes."python3.11"]
            memory_mb = 1024
            min_warm = 2
            target_warm = 4
            max_total = 16
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let tpl = &config.runtimes["python3.11"];
        assert_eq!(tpl.memory_mb, 1024);
        assert_eq!(tpl.min_warm, 2);
        assert_eq!(tpl.target_warm, 4);
        assert_eq!(tpl.max_total, 16);
        assert_eq!(tpl.vcpus, 1);
        assert_eq!(config.pool.max_invocations_per_sandbox, 50);
    }

    #[test]
    fn interval_accessors_convert_to_durations() {
        let settings = PoolSettings::default();
        assert_eq!(settings.health_check_interval(), Duration::from_secs(30));
        assert_eq!(settings.metrics_interval(), Duration::from_secs(1));
        assert_eq!(settings.max_sandbox_age(), Duration::from_secs(3600));
    }
}
