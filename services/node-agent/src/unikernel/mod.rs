//! Unikernel workload backend.
//!
//! Runs micro-VMs through a line-oriented control tool and parses the tool's
//! diagnostic output into workload state.
//!
//! ## Components
//!
//! - `backend`: `WorkloadBackend` implementation
//! - `output`: grammar for the tool's start/stop/status output

mod backend;
pub mod output;

pub use backend::{UnikernelBackend, UnikernelConfig, DEFAULT_CONTROL_TOOL, DEFAULT_IMAGE_LOCATION};
