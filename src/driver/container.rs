//! Container driver implementation (Docker).
//!
//! Each sandbox is a long-lived container whose entrypoint blocks forever;
//! invocations run as execs inside it. The container gets the host's layer
//! cache read-only at the fixed guest path, a size-bounded writable `/tmp`
//! tmpfs, a read-only root filesystem, no privilege escalation, and (by
//! default) no network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    DriverError, DriverResult, DynSandbox, ExecOutcome, ExecOutput, LAYER_GUEST_ROOT,
    MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE, RUNTIME_LABEL_KEY, Sandbox, SandboxDriver, SandboxSpec,
};
use crate::config::ContainerDriverConfig;
use crate::function::RuntimeClass;

/// Cheap in-container command used as the liveness probe.
const PING_CMD: &str = "/bin/true";

/// Docker container driver.
pub struct ContainerDriver {
    docker: Docker,
    config: ContainerDriverConfig,
}

impl ContainerDriver {
    /// Connects to the Docker daemon named in the configuration, or the
    /// local default socket.
    pub fn new(config: ContainerDriverConfig) -> DriverResult<Self> {
        let docker = if let Some(host) = &config.docker_host {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| DriverError::Connection(e.to_string()))?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| DriverError::Connection(e.to_string()))?
        };

        Ok(Self { docker, config })
    }
}

#[async_trait]
impl SandboxDriver for ContainerDriver {
    async fn create(&self, spec: &SandboxSpec) -> DriverResult<DynSandbox> {
        let name = format!("nimbus-{}-{}", spec.runtime, uuid::Uuid::new_v4().simple());

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL_KEY.to_string(), MANAGED_LABEL_VALUE.to_string());
        labels.insert(RUNTIME_LABEL_KEY.to_string(), spec.runtime.to_string());

        // Pooled sandboxes (no per-sandbox mounts) get the whole layer
        // cache read-only at the fixed guest path, so a warm container can
        // serve any layer set published later. One-off sandboxes mount
        // exactly the layers this invocation needs; both shapes expose the
        // same key-addressed guest paths.
        let binds = if spec.mounts.is_empty() {
            vec![format!(
                "{}:{}:ro",
                self.config.layer_cache_dir.display(),
                LAYER_GUEST_ROOT
            )]
        } else {
            spec.mounts
                .iter()
                .map(|m| format!("{}:{}:ro", m.host_dir.display(), m.guest_dir.display()))
                .collect()
        };

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,noexec,size={}m", self.config.tmpfs_size_mb),
        );

        let mut host_config = bollard::models::HostConfig {
            binds: Some(binds),
            network_mode: Some(self.config.network_mode.clone()),
            tmpfs: Some(tmpfs),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        if !self.config.disable_resource_limits {
            host_config.memory = Some(i64::from(spec.memory_mb) * 1024 * 1024);
            // CPU period in microseconds; quota caps at `vcpus` full cores.
            host_config.cpu_period = Some(100_000);
            host_config.cpu_quota = Some(i64::from(spec.vcpus) * 100_000);
        }

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            // Keep the container alive between execs.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions { name: &name, platform: None };
        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DriverError::CreateFailed(e.to_string()))?;
        let container_id = response.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
        {
            // Create is atomic: tear the half-made container down before
            // surfacing the error.
            let _ = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await;
            return Err(DriverError::CreateFailed(e.to_string()));
        }

        debug!(sandbox_id = %name, runtime = %spec.runtime, "container sandbox started");

        Ok(std::sync::Arc::new(ContainerSandbox {
            id: name,
            container_id,
            runtime: spec.runtime,
            docker: self.docker.clone(),
        }))
    }

    async fn reap_stale(&self) -> DriverResult<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}")],
        );

        let leftovers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;

        let mut reaped = 0;
        for container in leftovers {
            let Some(id) = container.id else { continue };
            match self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions { force: true, ..Default::default() }),
                )
                .await
            {
                Ok(()) => reaped += 1,
                Err(e) => warn!(container_id = %id, error = %e, "failed to reap stale container"),
            }
        }

        if reaped > 0 {
            info!(count = reaped, "reaped stale containers from a prior instance");
        }
        Ok(reaped)
    }

    fn name(&self) -> &'static str {
        "container"
    }
}

/// A sandbox backed by a Docker container.
pub struct ContainerSandbox {
    id: String,
    container_id: String,
    runtime: RuntimeClass,
    docker: Docker,
}

impl ContainerSandbox {
    /// Collects an exec's output streams until they close.
    async fn collect_output(
        output: &mut (impl futures::Stream<Item = Result<LogOutput, bollard::errors::Error>>
        + Unpin),
        stdout: &mut String,
        stderr: &mut String,
    ) {
        while let Some(msg) = output.next().await {
            match msg {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                _ => {}
            }
        }
    }

    /// Best-effort kill of everything inside the container's pid namespace
    /// except the blocking entrypoint (pid 1 is protected from `kill -1`).
    async fn kill_user_processes(&self) {
        let exec = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), "kill -9 -1".to_string()]),
            ..Default::default()
        };
        if let Ok(created) = self.docker.create_exec::<String>(&self.container_id, exec).await {
            let _ = self.docker.start_exec(&created.id, None).await;
        }
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> RuntimeClass {
        self.runtime
    }

    async fn exec(&self, envelope: &[u8], deadline: Duration) -> DriverResult<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(self.runtime.entrypoint()),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.container_id, exec_options)
            .await
            .map_err(|e| DriverError::ExecFailed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DriverError::ExecFailed(e.to_string()))?;

        let StartExecResults::Attached { mut output, mut input } = started else {
            return Err(DriverError::ExecFailed("exec did not attach".to_string()));
        };

        let mut stdout = String::new();
        let mut stderr = String::new();

        let run = async {
            input
                .write_all(envelope)
                .await
                .map_err(|e| DriverError::ExecFailed(format!("writing envelope: {e}")))?;
            input
                .shutdown()
                .await
                .map_err(|e| DriverError::ExecFailed(format!("closing stdin: {e}")))?;
            Self::collect_output(&mut output, &mut stdout, &mut stderr).await;
            Ok::<(), DriverError>(())
        };

        match tokio::time::timeout(deadline, run).await {
            Ok(result) => result?,
            Err(_) => {
                self.kill_user_processes().await;
                debug!(sandbox_id = %self.id, "exec deadline elapsed");
                return Ok(ExecOutput { outcome: ExecOutcome::Timeout, stdout, stderr });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DriverError::ExecFailed(e.to_string()))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        let outcome = if exit_code == 0 { ExecOutcome::Ok } else { ExecOutcome::RuntimeError };
        Ok(ExecOutput { outcome, stdout, stderr })
    }

    async fn health_ping(&self, deadline: Duration) -> bool {
        let ping = async {
            let exec = self
                .docker
                .create_exec(
                    &self.container_id,
                    CreateExecOptions {
                        cmd: Some(vec![PING_CMD.to_string()]),
                        ..Default::default()
                    },
                )
                .await
                .ok()?;
            self.docker.start_exec(&exec.id, None).await.ok()?;
            let inspect = self.docker.inspect_exec(&exec.id).await.ok()?;
            Some(inspect.exit_code.unwrap_or(-1) == 0)
        };

        matches!(tokio::time::timeout(deadline, ping).await, Ok(Some(true)))
    }

    async fn destroy(&self) -> DriverResult<()> {
        match self
            .docker
            .remove_container(
                &self.container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already gone counts as destroyed.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(DriverError::DestroyFailed(e.to_string())),
        }
    }
}
