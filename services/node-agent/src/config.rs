//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use fognode_reconcile::{RetryPolicy, DEFAULT_MAX_SEND_TRIES};

use crate::container::{ContainerConfig, DEFAULT_CONTAINER_CLI};
use crate::message_bus::DeliveryMode;
use crate::runtime::BackendKind;
use crate::unikernel::{UnikernelConfig, DEFAULT_CONTROL_TOOL, DEFAULT_IMAGE_LOCATION};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Which backend runs workloads.
    pub backend: BackendKind,

    /// Unikernel control tool binary.
    pub ukd_tool: String,

    /// Container CLI binary.
    pub container_cli: String,

    /// Directory holding unikernel images.
    pub image_location: PathBuf,

    /// Upper bound on a single lifecycle operation.
    pub operation_timeout_secs: u64,

    /// Memory held back from workloads; measured from the process when unset.
    pub reserved_memory_bytes: Option<u64>,

    /// Acknowledgement mode of the real-time message listener.
    pub delivery_mode: DeliveryMode,

    /// Seconds between control signal resends.
    pub signal_resend_secs: u64,

    /// Send attempts before a control signal is dropped.
    pub signal_max_tries: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Unikernel,
            ukd_tool: DEFAULT_CONTROL_TOOL.to_string(),
            container_cli: DEFAULT_CONTAINER_CLI.to_string(),
            image_location: PathBuf::from(DEFAULT_IMAGE_LOCATION),
            operation_timeout_secs: 60,
            reserved_memory_bytes: None,
            delivery_mode: DeliveryMode::AtMostOnce,
            signal_resend_secs: 10,
            signal_max_tries: DEFAULT_MAX_SEND_TRIES,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let backend = match lookup("FOGNODE_BACKEND") {
            Some(s) => s.parse::<BackendKind>().map_err(|e| anyhow!("FOGNODE_BACKEND: {e}"))?,
            None => defaults.backend,
        };

        let delivery_mode = match lookup("FOGNODE_DELIVERY_MODE") {
            Some(s) => s.parse::<DeliveryMode>().map_err(|e| anyhow!("FOGNODE_DELIVERY_MODE: {e}"))?,
            None => defaults.delivery_mode,
        };

        let ukd_tool = lookup("FOGNODE_UKD_TOOL").unwrap_or(defaults.ukd_tool);
        let container_cli = lookup("FOGNODE_CONTAINER_CLI").unwrap_or(defaults.container_cli);
        let image_location = lookup("FOGNODE_IMAGE_LOCATION")
            .map(PathBuf::from)
            .unwrap_or(defaults.image_location);

        let operation_timeout_secs = lookup("FOGNODE_OPERATION_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.operation_timeout_secs);

        let reserved_memory_bytes =
            lookup("FOGNODE_RESERVED_MEMORY_BYTES").and_then(|s| s.parse().ok());

        let signal_resend_secs = lookup("FOGNODE_SIGNAL_RESEND_SECS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.signal_resend_secs);

        let signal_max_tries = lookup("FOGNODE_SIGNAL_MAX_TRIES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.signal_max_tries);

        let log_level = lookup("FOGNODE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            backend,
            ukd_tool,
            container_cli,
            image_location,
            operation_timeout_secs,
            reserved_memory_bytes,
            delivery_mode,
            signal_resend_secs,
            signal_max_tries,
            log_level,
        })
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn unikernel(&self) -> UnikernelConfig {
        UnikernelConfig {
            control_tool: self.ukd_tool.clone(),
            image_location: self.image_location.clone(),
        }
    }

    pub fn container(&self) -> ContainerConfig {
        ContainerConfig {
            cli: self.container_cli.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            resend_interval: Duration::from_secs(self.signal_resend_secs),
            max_tries: self.signal_max_tries,
        }
    }
}
