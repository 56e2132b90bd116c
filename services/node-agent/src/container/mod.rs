//! Container workload backend driven through a docker-compatible CLI.

mod backend;
pub mod inspect;

pub use backend::{ContainerBackend, ContainerConfig, DEFAULT_CONTAINER_CLI};
