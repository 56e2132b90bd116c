//! Parsers for the container CLI's JSON output.
//!
//! Covers `inspect` (array of container documents), `stats --format
//! '{{json .}}'` and `ps --format '{{json .}}'` (one JSON object per line).

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::runtime::PortMapping;
use crate::status::WorkloadState;

/// Subset of `inspect` output the backend uses.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub state: InspectState,
    #[serde(default)]
    pub host_config: Option<InspectHostConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectState {
    pub status: String,
    #[serde(default)]
    pub started_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    #[serde(default)]
    pub port_bindings: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_port: String,
}

impl ContainerInspect {
    pub fn workload_state(&self) -> WorkloadState {
        state_from_cli(&self.state.status)
    }

    /// Start time in milliseconds since epoch, if the container ever ran.
    pub fn started_at_millis(&self) -> Option<i64> {
        chrono::DateTime::parse_from_rfc3339(&self.state.started_at)
            .ok()
            .map(|t| t.timestamp_millis())
            .filter(|millis| *millis > 0)
    }

    /// Published ports as a set of mappings.
    pub fn port_set(&self) -> BTreeSet<PortMapping> {
        let Some(bindings) = self
            .host_config
            .as_ref()
            .and_then(|hc| hc.port_bindings.as_ref())
        else {
            return BTreeSet::new();
        };

        let mut ports = BTreeSet::new();
        for (key, bindings) in bindings {
            let Some(inside) = key.split('/').next().and_then(|p| p.parse::<u16>().ok()) else {
                continue;
            };
            for binding in bindings.iter().flatten() {
                if let Ok(outside) = binding.host_port.parse::<u16>() {
                    ports.insert(PortMapping::new(inside, outside));
                }
            }
        }
        ports
    }
}

/// Parse `inspect` output for a single container.
pub fn parse_inspect(stdout: &str) -> Result<ContainerInspect> {
    let mut containers: Vec<ContainerInspect> =
        serde_json::from_str(stdout).map_err(|_| AgentError::parse("inspect output", stdout))?;
    if containers.is_empty() {
        return Err(AgentError::parse("inspect output", stdout));
    }
    Ok(containers.swap_remove(0))
}

/// Resource usage sampled by `stats`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerUsage {
    /// Percent of one CPU.
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// Parse one `stats --no-stream --format '{{json .}}'` line.
pub fn parse_stats(stdout: &str) -> Result<ContainerUsage> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| AgentError::parse("stats output", stdout))?;

    let stats: StatsLine =
        serde_json::from_str(line).map_err(|_| AgentError::parse("stats output", stdout))?;

    let cpu_percent = parse_percent(&stats.cpu_perc)
        .ok_or_else(|| AgentError::parse("stats cpu usage", stdout))?;
    let used = stats.mem_usage.split('/').next().unwrap_or("");
    let memory_bytes =
        parse_size(used).ok_or_else(|| AgentError::parse("stats memory usage", stdout))?;

    Ok(ContainerUsage {
        cpu_percent,
        memory_bytes,
    })
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// A container row from `ps`.
#[derive(Debug, Clone, PartialEq)]
pub struct PsEntry {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: WorkloadState,
}

/// Parse `ps --format '{{json .}}'` output (one object per line).
pub fn parse_ps(stdout: &str) -> Result<Vec<PsEntry>> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let row: PsLine =
                serde_json::from_str(line).map_err(|_| AgentError::parse("ps output", line))?;
            let name = row.names.split(',').next().unwrap_or("").to_string();
            Ok(PsEntry {
                id: row.id,
                name,
                image: row.image,
                state: if row.state.is_empty() {
                    WorkloadState::Running
                } else {
                    state_from_cli(&row.state)
                },
            })
        })
        .collect()
}

/// Map the CLI's container status onto a workload state.
pub fn state_from_cli(status: &str) -> WorkloadState {
    match status.to_ascii_lowercase().as_str() {
        "running" => WorkloadState::Running,
        "created" | "restarting" => WorkloadState::Starting,
        "removing" => WorkloadState::Stopping,
        "dead" => WorkloadState::Failed,
        _ => WorkloadState::Stopped,
    }
}

fn parse_percent(value: &str) -> Option<f64> {
    value.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

/// Parse a human-readable size such as `1.5MiB` or `512kB` into bytes.
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };

    Some((number * multiplier).round() as u64)
}
