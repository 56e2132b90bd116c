//! Process manager status registry.
//!
//! The registry aggregates what the reconciliation subsystem knows about the
//! node: how many workloads are running, whether the workload backend is
//! healthy, the state of every workload ever queried and the link state of
//! every image registry.
//!
//! The workload map and the registry-link map each sit behind their own lock
//! so status reads never contend with unrelated writers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Lifecycle state of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkloadState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Failed,
}

impl WorkloadState {
    /// Returns true while the workload occupies the host.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkloadState::Running | WorkloadState::Starting | WorkloadState::Stopping
        )
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadState::Running => write!(f, "RUNNING"),
            WorkloadState::Stopped => write!(f, "STOPPED"),
            WorkloadState::Starting => write!(f, "STARTING"),
            WorkloadState::Stopping => write!(f, "STOPPING"),
            WorkloadState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Health of the workload backend as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendHealth {
    Running,
    Stopped,
    Error,
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendHealth::Running => write!(f, "RUNNING"),
            BackendHealth::Stopped => write!(f, "STOPPED"),
            BackendHealth::Error => write!(f, "ERROR"),
        }
    }
}

/// Reachability of an image registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Ok,
    Broken,
    Unknown,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkStatus::Ok => write!(f, "OK"),
            LinkStatus::Broken => write!(f, "BROKEN"),
            LinkStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Observed status of one workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub state: WorkloadState,

    /// When the workload last entered RUNNING, in milliseconds since epoch
    /// (0 if it never ran).
    pub start_time: i64,

    /// CPU usage in percent of one core.
    pub cpu_usage: f64,

    /// Memory usage in bytes.
    pub memory_usage: u64,
}

impl Default for WorkloadStatus {
    fn default() -> Self {
        Self {
            state: WorkloadState::Stopped,
            start_time: 0,
            cpu_usage: 0.0,
            memory_usage: 0,
        }
    }
}

impl WorkloadStatus {
    /// Milliseconds spent running as of `now_millis`; 0 unless running.
    pub fn operating_duration_at(&self, now_millis: i64) -> i64 {
        if self.state == WorkloadState::Running && self.start_time > 0 {
            now_millis.saturating_sub(self.start_time).max(0)
        } else {
            0
        }
    }

    pub fn operating_duration(&self) -> i64 {
        self.operating_duration_at(now_millis())
    }

    /// Enter RUNNING, keeping the start time if the workload already ran.
    pub fn mark_running(&mut self, now_millis: i64) {
        if self.state != WorkloadState::Running || self.start_time == 0 {
            self.start_time = now_millis;
        }
        self.state = WorkloadState::Running;
    }

    /// Enter STOPPED and reset usage figures.
    pub fn mark_stopped(&mut self) {
        self.state = WorkloadState::Stopped;
        self.cpu_usage = 0.0;
        self.memory_usage = 0;
    }
}

/// Aggregated status of the process manager.
///
/// One instance lives for the lifetime of the agent; it is written by the
/// workload backends and the reconciliation loop and read by status reporting.
#[derive(Debug)]
pub struct StatusRegistry {
    running_count: AtomicUsize,
    backend_health: RwLock<BackendHealth>,
    workloads: Mutex<HashMap<String, WorkloadStatus>>,
    registries: RwLock<HashMap<String, LinkStatus>>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self {
            running_count: AtomicUsize::new(0),
            backend_health: RwLock::new(BackendHealth::Running),
            workloads: Mutex::new(HashMap::new()),
            registries: RwLock::new(HashMap::new()),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running_count.load(Ordering::SeqCst)
    }

    pub fn set_running_count(&self, count: usize) {
        self.running_count.store(count, Ordering::SeqCst);
    }

    pub fn backend_health(&self) -> BackendHealth {
        *self.backend_health.read()
    }

    pub fn set_backend_health(&self, health: BackendHealth) {
        *self.backend_health.write() = health;
    }

    /// Status of a workload, creating a STOPPED entry if none exists.
    pub fn get_or_create_workload(&self, workload_id: &str) -> WorkloadStatus {
        let mut workloads = self.workloads.lock();
        workloads
            .entry(workload_id.to_string())
            .or_default()
            .clone()
    }

    /// Status of a workload without creating an entry.
    pub fn workload(&self, workload_id: &str) -> Option<WorkloadStatus> {
        self.workloads.lock().get(workload_id).cloned()
    }

    /// Get-or-create a workload entry and mutate it in one critical section.
    ///
    /// Returns the status as left by `f`.
    pub fn update_workload<F>(&self, workload_id: &str, f: F) -> WorkloadStatus
    where
        F: FnOnce(&mut WorkloadStatus),
    {
        let mut workloads = self.workloads.lock();
        let status = workloads.entry(workload_id.to_string()).or_default();
        f(status);
        status.clone()
    }

    pub fn set_workload(&self, workload_id: &str, status: WorkloadStatus) {
        self.workloads.lock().insert(workload_id.to_string(), status);
    }

    pub fn remove_workload(&self, workload_id: &str) -> Option<WorkloadStatus> {
        self.workloads.lock().remove(workload_id)
    }

    /// Ids of all known workloads, sorted.
    pub fn workload_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workloads.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Upsert the link state of an image registry.
    pub fn set_registry_link(&self, url: &str, status: LinkStatus) {
        self.registries.write().insert(url.to_string(), status);
    }

    /// Link state of an image registry, if it was ever probed.
    pub fn registry_link(&self, url: &str) -> Option<LinkStatus> {
        self.registries.read().get(url).copied()
    }

    pub fn registries_count(&self) -> usize {
        self.registries.read().len()
    }

    /// Workload statuses as a JSON array, sorted by id.
    pub fn render_workloads_json(&self) -> String {
        self.render_workloads_json_at(now_millis())
    }

    pub fn render_workloads_json_at(&self, now_millis: i64) -> String {
        let mut entries: Vec<(String, WorkloadStatus)> = {
            let workloads = self.workloads.lock();
            workloads
                .iter()
                .map(|(id, status)| (id.clone(), status.clone()))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let rows: Vec<Value> = entries
            .into_iter()
            .map(|(id, status)| {
                json!({
                    "id": id,
                    "status": status.state.to_string(),
                    "starttime": status.start_time,
                    "operatingduration": status.operating_duration_at(now_millis),
                    "cpuusage": format_fixed2(status.cpu_usage),
                    "memoryusage": status.memory_usage.to_string(),
                })
            })
            .collect();

        Value::Array(rows).to_string()
    }

    /// Registry link states as a JSON array, sorted by url.
    pub fn render_registries_json(&self) -> String {
        let mut entries: Vec<(String, LinkStatus)> = {
            let registries = self.registries.read();
            registries
                .iter()
                .map(|(url, status)| (url.clone(), *status))
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let rows: Vec<Value> = entries
            .into_iter()
            .map(|(url, status)| json!({ "url": url, "linkstatus": status.to_string() }))
            .collect();

        Value::Array(rows).to_string()
    }
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format with two decimals, rounding half-up on the shortest decimal
/// representation of `value` (12.345 renders as "12.35").
pub fn format_fixed2(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }

    let repr = value.abs().to_string();
    let (int_part, frac_part) = repr.split_once('.').unwrap_or((repr.as_str(), ""));

    let mut digits: Vec<u8> = int_part
        .bytes()
        .chain(frac_part.bytes().chain(std::iter::repeat(b'0')).take(2))
        .map(|b| b - b'0')
        .collect();

    if frac_part.as_bytes().get(2).is_some_and(|d| *d >= b'5') {
        let mut i = digits.len();
        loop {
            if i == 0 {
                digits.insert(0, 1);
                break;
            }
            i -= 1;
            if digits[i] == 9 {
                digits[i] = 0;
            } else {
                digits[i] += 1;
                break;
            }
        }
    }

    let split = digits.len() - 2;
    let int_digits: String = digits[..split].iter().map(|d| char::from(b'0' + d)).collect();
    let frac_digits: String = digits[split..].iter().map(|d| char::from(b'0' + d)).collect();
    let is_zero = digits.iter().all(|d| *d == 0);
    let sign = if value.is_sign_negative() && !is_zero {
        "-"
    } else {
        ""
    };

    format!("{sign}{int_digits}.{frac_digits}")
}
