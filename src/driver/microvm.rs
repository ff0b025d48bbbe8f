//! Micro-VM driver implementation (Firecracker).
//!
//! Each sandbox is a tiny VM (kernel + per-runtime rootfs) with a TAP device
//! on the private bridge and a vsock channel to an in-guest agent. Exec
//! sends the invocation envelope over vsock; the agent loads the code,
//! invokes the handler, and returns JSON.
//!
//! With `use_snapshots` enabled the driver freezes the first cold-booted VM
//! of each runtime into a template and restores later sandboxes from it,
//! cutting creation to milliseconds. Restored VMs are indistinguishable from
//! cold-booted ones to the pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::network::{NetworkManager, VmNetwork};
use super::{
    DriverError, DriverResult, DynSandbox, ExecOutcome, ExecOutput, Sandbox, SandboxDriver,
    SandboxSpec,
};
use crate::config::MicroVmDriverConfig;
use crate::function::RuntimeClass;

/// How long to wait for the Firecracker API socket after spawn.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the in-guest agent after boot or restore.
const AGENT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Slack added to the invocation deadline before the host gives up on the
/// agent; the agent enforces the real deadline in-guest.
const EXEC_DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// Per-runtime snapshot template, taken from the first cold boot.
#[derive(Clone)]
struct SnapshotTemplate {
    snapshot_path: PathBuf,
    mem_path: PathBuf,
    rootfs_path: PathBuf,
}

/// Firecracker micro-VM driver.
pub struct MicroVmDriver {
    config: MicroVmDriverConfig,
    network: Arc<NetworkManager>,
    templates: Mutex<HashMap<RuntimeClass, SnapshotTemplate>>,
}

impl MicroVmDriver {
    pub fn new(config: MicroVmDriverConfig) -> DriverResult<Self> {
        let network = NetworkManager::new(&config.bridge_name, &config.subnet_cidr)
            .map_err(|e| DriverError::CreateFailed(e.to_string()))?;
        Ok(Self { config, network: Arc::new(network), templates: Mutex::new(HashMap::new()) })
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.config.data_dir.join("sandboxes").join(sandbox_id)
    }

    fn rootfs_source(&self, runtime: RuntimeClass) -> PathBuf {
        self.config.rootfs_dir.join(format!("rootfs-{runtime}.ext4"))
    }

    /// Boots a fresh VM: clone the rootfs, write the Firecracker config,
    /// spawn the process, and wait for the guest agent.
    async fn cold_boot(
        &self,
        sandbox_id: &str,
        spec: &SandboxSpec,
        net: &VmNetwork,
    ) -> DriverResult<Child> {
        let dir = self.sandbox_dir(sandbox_id);
        let rootfs = dir.join("rootfs.ext4");
        tokio::fs::copy(self.rootfs_source(spec.runtime), &rootfs)
            .await
            .map_err(|e| DriverError::CreateFailed(format!("cloning rootfs: {e}")))?;

        let config_path = dir.join("config.json");
        let api_socket = dir.join("api.sock");
        let vsock_path = dir.join("vsock.sock");

        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off",
            net.guest_ip,
            net.gateway,
            net.netmask()
        );
        let vm_config = json!({
            "boot-source": {
                "kernel_image_path": self.config.kernel_path,
                "boot_args": boot_args,
            },
            "drives": [{
                "drive_id": "rootfs",
                "path_on_host": rootfs,
                "is_root_device": true,
                "is_read_only": false,
            }],
            "machine-config": {
                "vcpu_count": spec.vcpus,
                "mem_size_mib": spec.memory_mb,
                "smt": false,
            },
            "vsock": {
                "guest_cid": 3,
                "uds_path": vsock_path,
            },
            "network-interfaces": [{
                "iface_id": "eth0",
                "host_dev_name": net.tap_name,
                "guest_mac": net.guest_mac,
            }],
        });
        tokio::fs::write(&config_path, serde_json::to_vec_pretty(&vm_config)?)
            .await
            .map_err(|e| DriverError::CreateFailed(format!("writing VM config: {e}")))?;

        let child = spawn_firecracker(&api_socket, Some(&config_path)).await?;
        write_pid_file(&dir, &child).await;

        let api = FirecrackerApi::new(&api_socket);
        api.wait_for_ready(API_READY_TIMEOUT).await?;
        Ok(child)
    }

    /// Boots a VM from the runtime's template snapshot.
    async fn restore_boot(
        &self,
        sandbox_id: &str,
        net: &VmNetwork,
        template: &SnapshotTemplate,
    ) -> DriverResult<Child> {
        let dir = self.sandbox_dir(sandbox_id);
        let api_socket = dir.join("api.sock");

        // Each restored VM gets its own copy of the template state; the
        // memory file is written to by the running VM.
        let mem = dir.join("mem_file");
        let state = dir.join("snapshot_file");
        let rootfs = dir.join("rootfs.ext4");
        for (src, dst) in [
            (&template.mem_path, &mem),
            (&template.snapshot_path, &state),
            (&template.rootfs_path, &rootfs),
        ] {
            tokio::fs::copy(src, dst)
                .await
                .map_err(|e| DriverError::CreateFailed(format!("cloning snapshot state: {e}")))?;
        }

        let child = spawn_firecracker(&api_socket, None).await?;
        write_pid_file(&dir, &child).await;

        let api = FirecrackerApi::new(&api_socket);
        api.wait_for_ready(API_READY_TIMEOUT).await?;
        // The snapshot references the template's TAP device; override it
        // with this sandbox's own.
        api.restore_snapshot(&state, &mem, &net.tap_name).await?;
        api.resume_vm().await?;
        Ok(child)
    }

    /// Freezes a just-booted VM into the runtime's template snapshot.
    async fn seed_template(
        &self,
        sandbox_id: &str,
        runtime: RuntimeClass,
    ) -> DriverResult<SnapshotTemplate> {
        let dir = self.sandbox_dir(sandbox_id);
        let snapshot_dir = self.config.data_dir.join("snapshots").join(runtime.as_str());
        tokio::fs::create_dir_all(&snapshot_dir)
            .await
            .map_err(|e| DriverError::CreateFailed(format!("creating snapshot dir: {e}")))?;

        let template = SnapshotTemplate {
            snapshot_path: snapshot_dir.join("snapshot_file"),
            mem_path: snapshot_dir.join("mem_file"),
            rootfs_path: snapshot_dir.join("rootfs.ext4"),
        };

        let api = FirecrackerApi::new(&dir.join("api.sock"));
        api.pause_vm().await?;
        let result = async {
            api.take_snapshot(&template.snapshot_path, &template.mem_path).await?;
            tokio::fs::copy(dir.join("rootfs.ext4"), &template.rootfs_path)
                .await
                .map_err(|e| DriverError::CreateFailed(format!("copying template rootfs: {e}")))?;
            Ok::<(), DriverError>(())
        }
        .await;
        // The donor VM keeps running either way.
        api.resume_vm().await?;
        result?;

        info!(runtime = %runtime, "snapshot template seeded");
        Ok(template)
    }
}

#[async_trait]
impl SandboxDriver for MicroVmDriver {
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<DynSandbox> {
        let sandbox_id = format!("nimbus-{}-{}", spec.runtime, uuid::Uuid::new_v4().simple());
        let dir = self.sandbox_dir(&sandbox_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DriverError::CreateFailed(format!("creating sandbox dir: {e}")))?;

        let net = match self.network.setup(&sandbox_id).await {
            Ok(net) => net,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(DriverError::CreateFailed(format!("network setup: {e}")));
            }
        };

        let template = if self.config.use_snapshots {
            self.templates.lock().await.get(&spec.runtime).cloned()
        } else {
            None
        };

        let booted = match &template {
            Some(tpl) => self.restore_boot(&sandbox_id, &net, tpl).await,
            None => self.cold_boot(&sandbox_id, spec, &net).await,
        };
        let child = match booted {
            Ok(child) => child,
            Err(e) => {
                self.network.teardown(&net).await;
                let _ = tokio::fs::remove_dir_all(&dir).await;
                return Err(e);
            }
        };

        let agent = AgentClient::new(dir.join("vsock.sock"), self.config.vsock_port);
        if let Err(e) = agent.wait_for_ready(AGENT_READY_TIMEOUT).await {
            let mut child = child;
            let _ = child.kill().await;
            self.network.teardown(&net).await;
            let _ = tokio::fs::remove_dir_all(&dir).await;
            return Err(DriverError::CreateFailed(format!("guest agent not ready: {e}")));
        }

        debug!(
            sandbox_id = %sandbox_id,
            runtime = %spec.runtime,
            restored = template.is_some(),
            "micro-VM sandbox running"
        );

        // First successful cold boot of a runtime seeds its template.
        if self.config.use_snapshots && template.is_none() {
            let mut templates = self.templates.lock().await;
            if !templates.contains_key(&spec.runtime) {
                match self.seed_template(&sandbox_id, spec.runtime).await {
                    Ok(tpl) => {
                        templates.insert(spec.runtime, tpl);
                    }
                    Err(e) => warn!(runtime = %spec.runtime, error = %e, "failed to seed snapshot template"),
                }
            }
        }

        Ok(Arc::new(MicroVmSandbox {
            id: sandbox_id,
            runtime: spec.runtime,
            dir,
            agent,
            net,
            network: Arc::clone(&self.network),
            child: Mutex::new(Some(child)),
        }))
    }

    async fn reap_stale(&self) -> DriverResult<usize> {
        let sandboxes_dir = self.config.data_dir.join("sandboxes");
        let mut entries = match tokio::fs::read_dir(&sandboxes_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(DriverError::Io(e)),
        };

        let mut reaped = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }

            if let Ok(pid) = tokio::fs::read_to_string(dir.join("firecracker.pid")).await
                && let Ok(pid) = pid.trim().parse::<u32>()
            {
                let _ = Command::new("kill").args(["-KILL", &pid.to_string()]).output().await;
            }

            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(dir = %dir.display(), error = %e, "failed to remove stale sandbox dir");
                continue;
            }
            reaped += 1;
        }

        if reaped > 0 {
            info!(count = reaped, "reaped stale micro-VMs from a prior instance");
        }
        Ok(reaped)
    }

    fn name(&self) -> &'static str {
        "microvm"
    }
}

/// A sandbox backed by a Firecracker micro-VM.
pub struct MicroVmSandbox {
    id: String,
    runtime: RuntimeClass,
    dir: PathBuf,
    agent: AgentClient,
    net: VmNetwork,
    network: Arc<NetworkManager>,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl Sandbox for MicroVmSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> RuntimeClass {
        self.runtime
    }

    async fn exec(&self, envelope: &[u8], deadline: Duration) -> DriverResult<ExecOutput> {
        // The agent enforces the deadline in-guest and kills the handler
        // process itself; the host allows a little slack on top before
        // declaring the VM unresponsive.
        match tokio::time::timeout(
            deadline + EXEC_DEADLINE_SLACK,
            self.agent.invoke(envelope, deadline),
        )
        .await
        {
            Ok(Ok(response)) => {
                let outcome = if response.timed_out {
                    ExecOutcome::Timeout
                } else if response.exit_code == 0 {
                    ExecOutcome::Ok
                } else {
                    ExecOutcome::RuntimeError
                };
                Ok(ExecOutput { outcome, stdout: response.stdout, stderr: response.stderr })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(ExecOutput {
                outcome: ExecOutcome::Timeout,
                stdout: String::new(),
                stderr: String::new(),
            }),
        }
    }

    async fn health_ping(&self, deadline: Duration) -> bool {
        matches!(tokio::time::timeout(deadline, self.agent.ping()).await, Ok(Ok(())))
    }

    async fn destroy(&self) -> DriverResult<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
            self.network.teardown(&self.net).await;
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::DestroyFailed(e.to_string())),
        }
    }
}

async fn spawn_firecracker(api_socket: &Path, config_file: Option<&Path>) -> DriverResult<Child> {
    let mut cmd = Command::new("firecracker");
    cmd.arg("--api-sock").arg(api_socket);
    if let Some(config) = config_file {
        cmd.arg("--config-file").arg(config);
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DriverError::CreateFailed(format!("spawning firecracker: {e}")))
}

async fn write_pid_file(dir: &Path, child: &Child) {
    if let Some(pid) = child.id() {
        let _ = tokio::fs::write(dir.join("firecracker.pid"), pid.to_string()).await;
    }
}

/// Result of one agent invocation.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    timed_out: bool,
}

/// Client for the in-guest agent, speaking newline-delimited JSON over the
/// Firecracker vsock Unix socket.
///
/// The host side of Firecracker's vsock is a Unix socket with a small
/// text handshake: write `CONNECT <port>\n`, read back `OK <hostport>\n`,
/// then the stream is the guest connection.
struct AgentClient {
    vsock_path: PathBuf,
    port: u32,
}

impl AgentClient {
    fn new(vsock_path: PathBuf, port: u32) -> Self {
        Self { vsock_path, port }
    }

    async fn connect(&self) -> DriverResult<BufReader<UnixStream>> {
        let stream = UnixStream::connect(&self.vsock_path)
            .await
            .map_err(|e| DriverError::Connection(format!("vsock connect: {e}")))?;
        let mut reader = BufReader::new(stream);

        reader
            .get_mut()
            .write_all(format!("CONNECT {}\n", self.port).as_bytes())
            .await
            .map_err(|e| DriverError::Connection(format!("vsock handshake: {e}")))?;

        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| DriverError::Connection(format!("vsock handshake: {e}")))?;
        if !line.starts_with("OK") {
            return Err(DriverError::Connection(format!(
                "vsock handshake rejected: {}",
                line.trim()
            )));
        }
        Ok(reader)
    }

    async fn request(&self, body: serde_json::Value) -> DriverResult<String> {
        let mut reader = self.connect().await?;

        let mut payload = serde_json::to_vec(&body)?;
        payload.push(b'\n');
        reader
            .get_mut()
            .write_all(&payload)
            .await
            .map_err(|e| DriverError::ExecFailed(format!("agent write: {e}")))?;

        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| DriverError::ExecFailed(format!("agent read: {e}")))?;
        if n == 0 {
            return Err(DriverError::Interrupted);
        }
        Ok(line)
    }

    async fn invoke(&self, envelope: &[u8], deadline: Duration) -> DriverResult<AgentResponse> {
        let envelope: serde_json::Value = serde_json::from_slice(envelope)?;
        let line = self
            .request(json!({
                "op": "invoke",
                "deadline_ms": deadline.as_millis() as u64,
                "envelope": envelope,
            }))
            .await?;
        let response: AgentResponse = serde_json::from_str(line.trim())
            .map_err(|e| DriverError::ExecFailed(format!("bad agent response: {e}")))?;
        Ok(response)
    }

    async fn ping(&self) -> DriverResult<()> {
        let line = self.request(json!({"op": "ping"})).await?;
        let value: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| DriverError::Connection(format!("bad ping response: {e}")))?;
        if value.get("ok").and_then(|v| v.as_bool()) == Some(true) {
            Ok(())
        } else {
            Err(DriverError::Connection("agent ping refused".to_string()))
        }
    }

    async fn wait_for_ready(&self, timeout: Duration) -> DriverResult<()> {
        let start = tokio::time::Instant::now();
        let mut last_err = DriverError::Connection("agent never answered".to_string());
        while start.elapsed() < timeout {
            match tokio::time::timeout(Duration::from_secs(1), self.ping()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_err = e,
                Err(_) => {}
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(last_err)
    }
}

/// Firecracker API client over its Unix-socket HTTP endpoint.
///
/// The API is plain HTTP/1.1 with tiny JSON bodies; a hand-rolled blocking
/// client on the blocking pool avoids dragging a Unix-socket HTTP stack in.
struct FirecrackerApi {
    socket_path: PathBuf,
}

impl FirecrackerApi {
    fn new(socket_path: &Path) -> Self {
        Self { socket_path: socket_path.to_path_buf() }
    }

    async fn wait_for_ready(&self, timeout: Duration) -> DriverResult<()> {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.socket_path.exists() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Err(DriverError::CreateFailed(format!(
            "firecracker API socket {} not ready after {timeout:?}",
            self.socket_path.display()
        )))
    }

    async fn send(&self, method: &str, path: &str, body: String) -> DriverResult<()> {
        use std::io::{Read, Write};
        use std::os::unix::net::UnixStream as StdUnixStream;

        let socket_path = self.socket_path.clone();
        let method = method.to_string();
        let path = path.to_string();
        let method_for_blocking = method.clone();
        let path_for_blocking = path.clone();

        let (status, response_body) = tokio::task::spawn_blocking(move || {
            let method = method_for_blocking;
            let path = path_for_blocking;
            let mut stream = StdUnixStream::connect(&socket_path).map_err(|e| {
                DriverError::Connection(format!("{}: {e}", socket_path.display()))
            })?;

            let request = format!(
                "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(request.as_bytes())
                .map_err(|e| DriverError::Connection(format!("API write: {e}")))?;
            stream.set_read_timeout(Some(Duration::from_secs(30))).ok();

            let mut response = String::new();
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        response.push_str(&String::from_utf8_lossy(&buf[..n]));
                        if response_complete(&response) {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        return Err(DriverError::Connection(format!("API read: {e}")));
                    }
                }
            }

            let status = parse_status_code(&response)?;
            let body = response
                .find("\r\n\r\n")
                .map(|i| response[i + 4..].to_string())
                .unwrap_or_default();
            Ok((status, body))
        })
        .await
        .map_err(|e| DriverError::Connection(format!("spawn_blocking: {e}")))??;

        if status >= 300 {
            return Err(DriverError::CreateFailed(format!(
                "{method} {path} returned {status}: {response_body}"
            )));
        }
        Ok(())
    }

    async fn pause_vm(&self) -> DriverResult<()> {
        self.send("PATCH", "/vm", r#"{"state":"Paused"}"#.to_string()).await
    }

    async fn resume_vm(&self) -> DriverResult<()> {
        self.send("PATCH", "/vm", r#"{"state":"Resumed"}"#.to_string()).await
    }

    async fn take_snapshot(&self, snapshot_path: &Path, mem_path: &Path) -> DriverResult<()> {
        let body = json!({
            "snapshot_type": "Full",
            "snapshot_path": snapshot_path,
            "mem_file_path": mem_path,
        });
        self.send("PUT", "/snapshot/create", body.to_string()).await
    }

    async fn restore_snapshot(
        &self,
        snapshot_path: &Path,
        mem_path: &Path,
        tap_name: &str,
    ) -> DriverResult<()> {
        let body = json!({
            "snapshot_path": snapshot_path,
            "mem_backend": { "backend_path": mem_path, "backend_type": "File" },
            "resume_vm": false,
            "network_overrides": [{ "iface_id": "eth0", "host_dev_name": tap_name }],
        });
        self.send("PUT", "/snapshot/load", body.to_string()).await
    }
}

fn response_complete(response: &str) -> bool {
    let Some(body_start) = response.find("\r\n\r\n") else { return false };
    match parse_content_length(&response[..body_start]) {
        Some(len) => response[body_start + 4..].len() >= len,
        // No content-length; Firecracker responses are small, assume done.
        None => true,
    }
}

fn parse_status_code(response: &str) -> DriverResult<u16> {
    let first_line = response.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let _version = parts.next();
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| DriverError::Connection(format!("invalid HTTP response: {first_line}")))
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") { value.trim().parse().ok() } else { None }
    })
}
