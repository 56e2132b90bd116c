//! Unikernel backend implementation.
//!
//! Drives micro-VMs through the local control tool:
//!
//! ```text
//! ukdctl status --name <id>
//! ukdctl start --image-location <image_location>/<image> --name <id>
//! ukdctl stop --name <id>
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec, OperationContext};
use crate::error::{AgentError, Result};
use crate::identity::{IdentityGuard, IdentityMap, WorkloadIdentity};
use crate::resources::{self, MemoryProbe};
use crate::runtime::{BackendKind, Workload, WorkloadBackend, WorkloadDescriptor};
use crate::status::{now_millis, StatusRegistry, WorkloadState, WorkloadStatus};

use super::output::{self, StartOutcome};

/// Default control tool binary.
pub const DEFAULT_CONTROL_TOOL: &str = "ukdctl";

/// Default directory holding unikernel images.
pub const DEFAULT_IMAGE_LOCATION: &str = "/osv-images";

/// Configuration for the unikernel backend.
#[derive(Debug, Clone)]
pub struct UnikernelConfig {
    /// Control tool binary.
    pub control_tool: String,
    /// Directory holding unikernel images.
    pub image_location: PathBuf,
}

impl Default for UnikernelConfig {
    fn default() -> Self {
        Self {
            control_tool: DEFAULT_CONTROL_TOOL.to_string(),
            image_location: PathBuf::from(DEFAULT_IMAGE_LOCATION),
        }
    }
}

/// Unikernel workload backend.
pub struct UnikernelBackend {
    config: UnikernelConfig,
    runner: Arc<dyn CommandRunner>,
    memory: Arc<dyn MemoryProbe>,
    status: Arc<StatusRegistry>,
    identities: IdentityMap,
}

impl UnikernelBackend {
    /// Create the backend.
    ///
    /// Fails with [`AgentError::Config`] if the image location is not an
    /// existing directory.
    pub fn new(
        config: UnikernelConfig,
        runner: Arc<dyn CommandRunner>,
        memory: Arc<dyn MemoryProbe>,
        status: Arc<StatusRegistry>,
    ) -> Result<Self> {
        if !config.image_location.is_dir() {
            return Err(AgentError::Config(format!(
                "image location {} is not a directory",
                config.image_location.display()
            )));
        }

        info!(
            control_tool = %config.control_tool,
            image_location = %config.image_location.display(),
            "Creating unikernel backend"
        );

        Ok(Self {
            config,
            runner,
            memory,
            status,
            identities: IdentityMap::new(),
        })
    }

    pub fn config(&self) -> &UnikernelConfig {
        &self.config
    }

    pub fn identities(&self) -> &IdentityMap {
        &self.identities
    }

    /// Record the identity a subsequent `start` will launch.
    pub async fn register(&self, identity: WorkloadIdentity) {
        debug!(app_id = %identity.app_id, image = %identity.image_name, "Registering identity");
        self.identities.register(identity).await;
    }

    /// Resolve an image file inside the image location.
    ///
    /// The name must be a single plain file name.
    fn image_path(&self, image_name: &str) -> Result<PathBuf> {
        let mut components = Path::new(image_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None) if name == image_name => {
                Ok(self.config.image_location.join(name))
            }
            _ => Err(AgentError::Config(format!(
                "invalid image name: {image_name:?}"
            ))),
        }
    }

    fn tool(&self) -> CommandSpec {
        CommandSpec::new(&self.config.control_tool)
    }

    fn known_identity(guard: &IdentityGuard<'_>) -> Result<WorkloadIdentity> {
        guard.identity().ok_or_else(|| {
            AgentError::Config(format!("unknown application id: {}", guard.app_id()))
        })
    }

    async fn launch(
        &self,
        guard: &IdentityGuard<'_>,
        identity: &WorkloadIdentity,
        image: &Path,
        ctx: &OperationContext,
    ) -> Result<StartOutcome> {
        let command = self
            .tool()
            .arg("start")
            .arg("--image-location")
            .arg(image.to_string_lossy())
            .arg("--name")
            .arg(&identity.app_id);

        let result = self.runner.run(&command, ctx).await?;
        debug!(app_id = %identity.app_id, stderr = %result.stderr(), "Start output");

        let report = output::parse_start(result.stderr())?;
        let outcome = output::start_outcome(report, result.stderr())?;
        match &outcome {
            StartOutcome::Started { address } => {
                guard.set_address(address);
                info!(app_id = %identity.app_id, address = %address, "Unikernel started");
            }
            StartOutcome::AlreadyRunning => {
                info!(app_id = %identity.app_id, "Unikernel already running");
            }
        }
        Ok(outcome)
    }

    async fn halt(&self, guard: &IdentityGuard<'_>, ctx: &OperationContext) -> Result<()> {
        let app_id = guard.app_id();
        let command = self.tool().arg("stop").arg("--name").arg(app_id);

        let result = self.runner.run(&command, ctx).await?;
        debug!(app_id = %app_id, stderr = %result.stderr(), "Stop output");

        let report = output::parse_stop(result.stderr())?;
        if !report.confirmed() {
            return Err(AgentError::Execution(format!(
                "workload not stopped: {}",
                report.info
            )));
        }

        guard.remove();
        info!(app_id = %app_id, "Unikernel stopped");
        Ok(())
    }
}

#[async_trait]
impl WorkloadBackend for UnikernelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Unikernel
    }

    async fn connect(&self, _ctx: &OperationContext) -> Result<()> {
        // The control tool runs locally; there is no daemon connection.
        Ok(())
    }

    async fn is_connected(&self, _ctx: &OperationContext) -> bool {
        true
    }

    async fn status(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus> {
        let command = self.tool().arg("status").arg("--name").arg(id);
        let result = self.runner.run(&command, ctx).await?;
        let observed = output::parse_status(result.stdout());
        debug!(app_id = %id, observed = %observed, "Status queried");

        let now = now_millis();
        Ok(self.status.update_workload(id, |status| match observed {
            WorkloadState::Running => status.mark_running(now),
            _ if status.state.is_active() => status.mark_stopped(),
            _ => {}
        }))
    }

    async fn start(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus> {
        let guard = self.identities.lock(id).await;
        let identity = Self::known_identity(&guard)?;
        let image = self.image_path(&identity.image_name)?;

        resources::admit_start(self.memory.as_ref())?;

        info!(app_id = %id, image = %identity.image_name, "Starting unikernel");
        let previous = self.status.get_or_create_workload(id);
        self.status
            .update_workload(id, |status| status.state = WorkloadState::Starting);

        match self.launch(&guard, &identity, &image, ctx).await {
            Ok(outcome) => {
                let now = now_millis();
                Ok(self.status.update_workload(id, |status| {
                    status.mark_running(now);
                    // An instance that was already up keeps its start time.
                    if outcome == StartOutcome::AlreadyRunning
                        && previous.state == WorkloadState::Running
                    {
                        status.start_time = previous.start_time;
                    }
                }))
            }
            Err(e) => {
                warn!(app_id = %id, error = %e, "Failed to start unikernel");
                self.status
                    .update_workload(id, |status| status.state = WorkloadState::Failed);
                Err(e)
            }
        }
    }

    async fn stop(&self, id: &str, ctx: &OperationContext) -> Result<()> {
        let guard = self.identities.lock(id).await;
        Self::known_identity(&guard)?;

        info!(app_id = %id, "Stopping unikernel");
        self.status
            .update_workload(id, |status| status.state = WorkloadState::Stopping);

        match self.halt(&guard, ctx).await {
            Ok(()) => {
                self.status.update_workload(id, |status| status.mark_stopped());
                Ok(())
            }
            Err(e) => {
                warn!(app_id = %id, error = %e, "Failed to stop unikernel");
                self.status
                    .update_workload(id, |status| status.state = WorkloadState::Failed);
                Err(e)
            }
        }
    }

    async fn pull_image(&self, image: &str, _ctx: &OperationContext) -> Result<()> {
        let path = self.image_path(image)?;
        if !is_file(&path).await {
            return Err(AgentError::Execution(format!(
                "image {} not found in {}",
                image,
                self.config.image_location.display()
            )));
        }
        debug!(image = %image, "Image present");
        Ok(())
    }

    async fn remove_image(&self, image: &str, _ctx: &OperationContext) -> Result<()> {
        let path = self.image_path(image)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(image = %image, "Image removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::Execution(format!(
                "failed to remove image {}: {e}",
                path.display()
            ))),
        }
    }

    /// Identities whose last observed state is RUNNING.
    async fn list(&self, _ctx: &OperationContext) -> Result<Vec<WorkloadDescriptor>> {
        Ok(self
            .identities
            .snapshot()
            .into_iter()
            .filter_map(|identity| {
                let state = self.status.workload(&identity.app_id)?.state;
                if state != WorkloadState::Running {
                    return None;
                }
                let address = identity.has_address().then(|| identity.ip_address.clone());
                Some(WorkloadDescriptor {
                    id: identity.app_id,
                    runtime_id: None,
                    image: identity.image_name,
                    state,
                    address,
                })
            })
            .collect())
    }

    async fn ports_match(&self, _workload: &Workload, _ctx: &OperationContext) -> Result<bool> {
        // The control tool has no port-mapping model.
        Ok(true)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}
