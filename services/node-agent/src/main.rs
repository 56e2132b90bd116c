//! fognode Node Agent
//!
//! Diagnostic entry point: launches one workload on the configured backend,
//! prints the resulting workload status and stops it again.
//!
//! ```text
//! node-agent -a HelloWorldApp -i aarch64-loader.img [-p /osv-images]
//! FOGNODE_BACKEND=container node-agent -a web -i nginx:1.25
//! ```
//!
//! With the container backend `-a` names an existing container and `-i` is
//! pulled before it is started.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fognode_node_agent::config::Config;
use fognode_node_agent::container::ContainerBackend;
use fognode_node_agent::resources::{HostMemoryProbe, SystemResources};
use fognode_node_agent::runtime::BackendKind;
use fognode_node_agent::unikernel::UnikernelBackend;
use fognode_node_agent::{
    CommandRunner, OperationContext, ProcessRunner, StatusRegistry, WorkloadBackend,
    WorkloadIdentity,
};

/// Start, report and stop a single workload.
#[derive(Debug, Parser)]
#[command(name = "node-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Application id the workload runs under.
    #[arg(short = 'a', long)]
    app_id: String,

    /// Image file name inside the image directory, or container image.
    #[arg(short = 'i', long)]
    image_name: String,

    /// Directory holding unikernel images.
    #[arg(short = 'p', long)]
    image_path: Option<PathBuf>,
}

/// Backend selected by `FOGNODE_BACKEND`.
enum Backend {
    Unikernel(UnikernelBackend),
    Container(ContainerBackend),
}

impl Backend {
    fn build(
        config: &Config,
        runner: Arc<dyn CommandRunner>,
        status: Arc<StatusRegistry>,
    ) -> Result<Self> {
        match config.backend {
            BackendKind::Unikernel => UnikernelBackend::new(
                config.unikernel(),
                runner,
                Arc::new(HostMemoryProbe::with_reserved(config.reserved_memory_bytes)),
                status,
            )
            .map(Backend::Unikernel)
            .context("failed to create unikernel backend"),
            BackendKind::Container => Ok(Backend::Container(ContainerBackend::new(
                config.container(),
                runner,
                status,
            ))),
        }
    }

    fn workloads(&self) -> &dyn WorkloadBackend {
        match self {
            Backend::Unikernel(backend) => backend,
            Backend::Container(backend) => backend,
        }
    }

    /// Make the workload startable.
    async fn prepare(&self, cli: &Cli, ctx: &OperationContext) -> Result<()> {
        match self {
            Backend::Unikernel(backend) => {
                backend
                    .register(WorkloadIdentity::new(&cli.app_id, &cli.image_name))
                    .await;
            }
            Backend::Container(backend) => {
                backend
                    .connect(ctx)
                    .await
                    .context("container engine unreachable")?;
                backend
                    .pull_image(&cli.image_name, ctx)
                    .await
                    .with_context(|| format!("failed to pull {}", cli.image_name))?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    match cli.image_path.clone() {
        Some(path) => config.image_location = path,
        None => warn!(
            image_location = %config.image_location.display(),
            "No image path given, using default image location"
        ),
    }

    let resources = SystemResources::measure();
    info!(
        cpu_cores = resources.cpu_cores,
        total_memory_bytes = resources.total_memory_bytes,
        available_memory_bytes = resources.available_memory_bytes,
        "Starting fognode node agent"
    );

    info!(
        backend = %config.backend,
        delivery_mode = %config.delivery_mode,
        signal_resend_secs = config.signal_resend_secs,
        signal_max_tries = config.signal_max_tries,
        "Agent configuration"
    );

    let status = Arc::new(StatusRegistry::new());
    let backend = Backend::build(&config, Arc::new(ProcessRunner::new()), Arc::clone(&status))?;

    let ctx = OperationContext::new(config.operation_timeout());
    tokio::spawn({
        let token = ctx.cancellation_token().clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal");
                token.cancel();
            }
        }
    });

    backend.prepare(&cli, &ctx).await?;

    let workloads = backend.workloads();
    let started = workloads.start(&cli.app_id, &ctx).await;
    println!("{}", status.render_workloads_json());
    if let Err(e) = started {
        error!(app_id = %cli.app_id, error = %e, "Start failed");
        return Err(e).context(format!("failed to start {}", cli.app_id));
    }

    if let Backend::Unikernel(unikernel) = &backend {
        if let Some(identity) = unikernel.identities().get(&cli.app_id) {
            info!(app_id = %identity.app_id, address = %identity.ip_address, "Unikernel is up");
        }
    }

    workloads
        .stop(&cli.app_id, &ctx)
        .await
        .with_context(|| format!("failed to stop {}", cli.app_id))?;
    println!("{}", status.render_workloads_json());

    info!("Node agent shutdown complete");
    Ok(())
}
