//! Container backend implementation.
//!
//! Drives containers through a docker-compatible CLI:
//!
//! ```text
//! docker version --format {{.Server.Version}}
//! docker inspect <id>
//! docker stats --no-stream --format {{json .}} <id>
//! docker start|stop <id>
//! docker pull|rmi <image>
//! docker ps --no-trunc --format {{json .}}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec, ExecutionResult, OperationContext};
use crate::error::{AgentError, Result};
use crate::runtime::{BackendKind, Workload, WorkloadBackend, WorkloadDescriptor};
use crate::status::{now_millis, BackendHealth, StatusRegistry, WorkloadState, WorkloadStatus};

use super::inspect::{self, ContainerInspect};

/// Default container CLI binary.
pub const DEFAULT_CONTAINER_CLI: &str = "docker";

const JSON_FORMAT: &str = "{{json .}}";
const SERVER_VERSION_FORMAT: &str = "{{.Server.Version}}";

/// Configuration for the container backend.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container CLI binary.
    pub cli: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cli: DEFAULT_CONTAINER_CLI.to_string(),
        }
    }
}

/// Container workload backend.
pub struct ContainerBackend {
    config: ContainerConfig,
    runner: Arc<dyn CommandRunner>,
    status: Arc<StatusRegistry>,
}

impl ContainerBackend {
    pub fn new(
        config: ContainerConfig,
        runner: Arc<dyn CommandRunner>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        info!(cli = %config.cli, "Creating container backend");
        Self {
            config,
            runner,
            status,
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    fn cli(&self) -> CommandSpec {
        CommandSpec::new(&self.config.cli)
    }

    /// Run a CLI command and require a zero exit code.
    async fn run_checked(&self, command: CommandSpec, ctx: &OperationContext) -> Result<ExecutionResult> {
        debug!(command = %command, "Running container CLI");
        let result = self.runner.run(&command, ctx).await?;
        if result.success() {
            return Ok(result);
        }
        Err(classify_failure(&command, &result))
    }

    /// Inspect a container; `None` if the CLI reports no such container.
    async fn inspect(&self, id: &str, ctx: &OperationContext) -> Result<Option<ContainerInspect>> {
        let command = self.cli().arg("inspect").arg(id);
        let result = self.runner.run(&command, ctx).await?;
        if !result.success() {
            if is_missing(result.stderr()) {
                return Ok(None);
            }
            return Err(classify_failure(&command, &result));
        }
        inspect::parse_inspect(result.stdout()).map(Some)
    }

    async fn sample_usage(&self, id: &str, ctx: &OperationContext) -> Result<inspect::ContainerUsage> {
        let command = self
            .cli()
            .arg("stats")
            .arg("--no-stream")
            .arg("--format")
            .arg(JSON_FORMAT)
            .arg(id);
        let result = self.run_checked(command, ctx).await?;
        inspect::parse_stats(result.stdout())
    }

    fn record_failure(&self, id: &str, op: &str, e: &AgentError) {
        warn!(container = %id, op = op, error = %e, "Container operation failed");
        self.status
            .update_workload(id, |status| status.state = WorkloadState::Failed);
    }
}

#[async_trait]
impl WorkloadBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn connect(&self, ctx: &OperationContext) -> Result<()> {
        let command = self
            .cli()
            .arg("version")
            .arg("--format")
            .arg(SERVER_VERSION_FORMAT);

        let outcome = match self.runner.run(&command, ctx).await {
            Ok(result) if result.success() => Ok(result.stdout().trim().to_string()),
            Ok(result) => Err(AgentError::Connection(format!(
                "container daemon unavailable: {}",
                result.stderr().trim()
            ))),
            Err(e) => Err(AgentError::Connection(e.to_string())),
        };

        match outcome {
            Ok(version) => {
                info!(version = %version, "Connected to container daemon");
                self.status.set_backend_health(BackendHealth::Running);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to container daemon");
                self.status.set_backend_health(BackendHealth::Error);
                Err(e)
            }
        }
    }

    async fn is_connected(&self, ctx: &OperationContext) -> bool {
        let command = self
            .cli()
            .arg("version")
            .arg("--format")
            .arg(SERVER_VERSION_FORMAT);
        matches!(self.runner.run(&command, ctx).await, Ok(result) if result.success())
    }

    async fn status(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus> {
        let Some(container) = self.inspect(id, ctx).await? else {
            debug!(container = %id, "Container not present");
            return Ok(self.status.update_workload(id, |status| {
                if status.state != WorkloadState::Failed {
                    status.mark_stopped();
                }
            }));
        };

        let observed = container.workload_state();
        debug!(container = %id, observed = %observed, "Status queried");

        if observed != WorkloadState::Running {
            return Ok(self.status.update_workload(id, |status| match observed {
                WorkloadState::Stopped if status.state == WorkloadState::Failed => {}
                WorkloadState::Stopped => status.mark_stopped(),
                other => status.state = other,
            }));
        }

        let started = container.started_at_millis().unwrap_or_else(now_millis);
        let usage = match self.sample_usage(id, ctx).await {
            Ok(usage) => Some(usage),
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to sample container usage");
                None
            }
        };

        Ok(self.status.update_workload(id, |status| {
            status.state = WorkloadState::Running;
            status.start_time = started;
            if let Some(usage) = usage {
                status.cpu_usage = usage.cpu_percent;
                status.memory_usage = usage.memory_bytes;
            }
        }))
    }

    async fn start(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus> {
        info!(container = %id, "Starting container");
        self.status
            .update_workload(id, |status| status.state = WorkloadState::Starting);

        let command = self.cli().arg("start").arg(id);
        if let Err(e) = self.run_checked(command, ctx).await {
            self.record_failure(id, "start", &e);
            return Err(e);
        }

        let started = match self.inspect(id, ctx).await {
            Ok(Some(container)) => container.started_at_millis(),
            Ok(None) => None,
            Err(e) => {
                warn!(container = %id, error = %e, "Failed to inspect started container");
                None
            }
        };

        info!(container = %id, "Container started");
        let now = now_millis();
        Ok(self.status.update_workload(id, |status| {
            status.mark_running(now);
            if let Some(started) = started {
                status.start_time = started;
            }
        }))
    }

    async fn stop(&self, id: &str, ctx: &OperationContext) -> Result<()> {
        info!(container = %id, "Stopping container");
        self.status
            .update_workload(id, |status| status.state = WorkloadState::Stopping);

        let command = self.cli().arg("stop").arg(id);
        match self.run_checked(command, ctx).await {
            Ok(_) => {
                info!(container = %id, "Container stopped");
                self.status.update_workload(id, |status| status.mark_stopped());
                Ok(())
            }
            Err(e) => {
                self.record_failure(id, "stop", &e);
                Err(e)
            }
        }
    }

    async fn pull_image(&self, image: &str, ctx: &OperationContext) -> Result<()> {
        info!(image = %image, "Pulling image");
        self.run_checked(self.cli().arg("pull").arg(image), ctx)
            .await?;
        Ok(())
    }

    async fn remove_image(&self, image: &str, ctx: &OperationContext) -> Result<()> {
        info!(image = %image, "Removing image");
        self.run_checked(self.cli().arg("rmi").arg(image), ctx)
            .await?;
        Ok(())
    }

    async fn list(&self, ctx: &OperationContext) -> Result<Vec<WorkloadDescriptor>> {
        let command = self
            .cli()
            .arg("ps")
            .arg("--no-trunc")
            .arg("--format")
            .arg(JSON_FORMAT);
        let result = self.run_checked(command, ctx).await?;

        Ok(inspect::parse_ps(result.stdout())?
            .into_iter()
            .map(|entry| WorkloadDescriptor {
                id: entry.name,
                runtime_id: Some(entry.id),
                image: entry.image,
                state: entry.state,
                address: None,
            })
            .collect())
    }

    async fn ports_match(&self, workload: &Workload, ctx: &OperationContext) -> Result<bool> {
        let Some(container) = self.inspect(&workload.id, ctx).await? else {
            return Ok(false);
        };
        Ok(container.port_set() == workload.port_set())
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
}

fn classify_failure(command: &CommandSpec, result: &ExecutionResult) -> AgentError {
    let stderr = result.stderr().trim();
    if is_daemon_unreachable(stderr) {
        return AgentError::Connection(stderr.to_string());
    }
    AgentError::Execution(format!(
        "`{command}` exited with {}: {stderr}",
        result.exit_code()
    ))
}
