//! fognode Node Agent Library
//!
//! The node agent runs on each edge host and owns the lifecycle of the
//! workloads placed there, either unikernel micro-VMs or containers. It turns
//! lifecycle intents into invocations of external tools, parses their output
//! into structured state and aggregates that state for status reporting.
//!
//! ## Architecture
//!
//! ```text
//! lifecycle manager
//!   └── WorkloadBackend (unikernel | container)
//!         ├── CommandRunner      (external tool invocation)
//!         ├── IdentityMap        (app id -> image, address)
//!         └── StatusRegistry     (per-workload and per-registry state)
//!
//! resend loop  ── ControlSignalTracker ──> remote supervisor
//! transport    ── MessageListener ──> real-time consumers
//! ```
//!
//! ## Modules
//!
//! - `command`: process execution with timeout and cancellation
//! - `unikernel`, `container`: the two backend variants
//! - `status`: status registry and its JSON rendering
//! - `signals`: control signal resend loop
//! - `message_bus`: real-time message codec and delivery listener

pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod identity;
pub mod message_bus;
pub mod resources;
pub mod runtime;
pub mod signals;
pub mod status;
pub mod unikernel;

// Re-export commonly used types
pub use command::{CommandRunner, CommandSpec, ExecutionResult, OperationContext, ProcessRunner};
pub use error::{AgentError, Result};
pub use identity::{IdentityMap, WorkloadIdentity};
pub use runtime::{BackendKind, Workload, WorkloadBackend};
pub use status::{StatusRegistry, WorkloadState, WorkloadStatus};
