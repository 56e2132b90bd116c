//! Workload runtime interface.
//!
//! The runtime interface abstracts workload lifecycle operations so the
//! reconciliation layer does not care which mechanism runs a workload:
//! - `unikernel`: micro-VMs driven through a line-oriented control tool
//! - `container`: containers driven through a docker-compatible CLI
//!
//! Both variants record every state transition in the shared
//! [`StatusRegistry`](crate::status::StatusRegistry). Neither retries on its
//! own; retry policy belongs to the caller.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::OperationContext;
use crate::error::Result;
use crate::status::{WorkloadState, WorkloadStatus};

/// Which backend variant runs the node's workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Unikernel,
    Container,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Unikernel => write!(f, "unikernel"),
            BackendKind::Container => write!(f, "container"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unikernel" | "ukd" => Ok(BackendKind::Unikernel),
            "container" | "docker" => Ok(BackendKind::Container),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// Host-to-workload port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the workload.
    pub inside: u16,
    /// Port published on the host.
    pub outside: u16,
}

impl PortMapping {
    pub fn new(inside: u16, outside: u16) -> Self {
        Self { inside, outside }
    }
}

/// A workload as the lifecycle manager describes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    pub desired_state: WorkloadState,
}

impl Workload {
    /// Port mappings as a set, for order-insensitive comparison.
    pub fn port_set(&self) -> BTreeSet<PortMapping> {
        self.port_mappings.iter().copied().collect()
    }
}

/// A workload the backend currently knows to be present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    /// Logical workload id (application id / container name).
    pub id: String,
    /// Runtime-assigned id, when the runtime has one.
    pub runtime_id: Option<String>,
    pub image: String,
    pub state: WorkloadState,
    pub address: Option<String>,
}

/// Lifecycle operations every backend provides.
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Establish (or verify) the connection to the runtime.
    async fn connect(&self, ctx: &OperationContext) -> Result<()>;

    async fn is_connected(&self, ctx: &OperationContext) -> bool;

    /// Query the runtime and record the observed state.
    async fn status(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus>;

    /// Start a workload; returns its status once the runtime reports it.
    async fn start(&self, id: &str, ctx: &OperationContext) -> Result<WorkloadStatus>;

    async fn stop(&self, id: &str, ctx: &OperationContext) -> Result<()>;

    async fn pull_image(&self, image: &str, ctx: &OperationContext) -> Result<()>;

    async fn remove_image(&self, image: &str, ctx: &OperationContext) -> Result<()>;

    /// Workloads currently present on the node.
    async fn list(&self, ctx: &OperationContext) -> Result<Vec<WorkloadDescriptor>>;

    /// Whether the running workload publishes exactly the desired ports.
    async fn ports_match(&self, workload: &Workload, ctx: &OperationContext) -> Result<bool>;

    /// Whether the runtime answers a status query for the workload.
    async fn exists(&self, id: &str, ctx: &OperationContext) -> bool {
        self.status(id, ctx).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("unikernel".parse::<BackendKind>(), Ok(BackendKind::Unikernel));
        assert_eq!("Docker".parse::<BackendKind>(), Ok(BackendKind::Container));
        assert!("vm".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Container.to_string(), "container");
    }

    #[test]
    fn test_port_set_ignores_order() {
        let a = Workload {
            id: "web".to_string(),
            image: "nginx".to_string(),
            port_mappings: vec![PortMapping::new(80, 8080), PortMapping::new(443, 8443)],
            desired_state: WorkloadState::Running,
        };
        let mut b = a.clone();
        b.port_mappings.reverse();
        assert_eq!(a.port_set(), b.port_set());
    }

    #[test]
    fn test_workload_deserialize_defaults_ports() {
        let workload: Workload = serde_json::from_str(
            r#"{"id":"web","image":"nginx","desired_state":"RUNNING"}"#,
        )
        .unwrap();
        assert!(workload.port_mappings.is_empty());
        assert_eq!(workload.desired_state, WorkloadState::Running);
    }
}
