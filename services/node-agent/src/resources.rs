//! Host resource measurement and start admission.
//!
//! Before a unikernel is launched the agent checks that the host has room
//! for it: the memory a start requires is a quarter of physical memory,
//! capped at 256 MiB, and must fit in what is left after the agent's own
//! reservation.

use tracing::debug;

use crate::error::{AgentError, Result};

pub const MIB: u64 = 1024 * 1024;

/// Upper bound on the memory a single start requires.
pub const MAX_START_MEMORY_BYTES: u64 = 256 * MIB;

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub cpu_cores: i32,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }
}

/// Source of the two numbers start admission depends on.
pub trait MemoryProbe: Send + Sync {
    /// Total physical memory of the host.
    fn total_physical_bytes(&self) -> u64;

    /// Memory held back for the agent itself.
    fn reserved_bytes(&self) -> u64;
}

/// Reads memory figures from the running host.
#[derive(Debug, Clone, Default)]
pub struct HostMemoryProbe {
    reserved_override: Option<u64>,
}

impl HostMemoryProbe {
    /// Probe whose reservation is the agent's resident set size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe with a fixed reservation.
    pub fn with_reserved(reserved_bytes: Option<u64>) -> Self {
        Self {
            reserved_override: reserved_bytes,
        }
    }
}

impl MemoryProbe for HostMemoryProbe {
    fn total_physical_bytes(&self) -> u64 {
        get_memory_info().0
    }

    fn reserved_bytes(&self) -> u64 {
        self.reserved_override
            .unwrap_or_else(own_resident_set_bytes)
    }
}

/// Probe returning fixed figures.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe {
    pub total_bytes: u64,
    pub reserved_bytes: u64,
}

impl FixedMemoryProbe {
    pub fn new(total_bytes: u64, reserved_bytes: u64) -> Self {
        Self {
            total_bytes,
            reserved_bytes,
        }
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn total_physical_bytes(&self) -> u64 {
        self.total_bytes
    }

    fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }
}

/// Memory a start requires on a host with `total_bytes` of physical memory.
pub fn required_start_memory(total_bytes: u64) -> u64 {
    (total_bytes / 4).min(MAX_START_MEMORY_BYTES)
}

/// Fail with [`AgentError::Resource`] if a start cannot be admitted.
pub fn admit_start(probe: &dyn MemoryProbe) -> Result<()> {
    let total = probe.total_physical_bytes();
    let reserved = probe.reserved_bytes();
    let required = required_start_memory(total);
    let available = total.saturating_sub(reserved);

    debug!(total, reserved, required, available, "Checking start admission");

    if available < required {
        return Err(AgentError::Resource {
            required,
            available,
        });
    }
    Ok(())
}

fn get_cpu_count() -> i32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as i32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    sysconf_memory_info()
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    sysconf_memory_info()
}

fn sysconf_memory_info() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size as u64) * (total_pages as u64);
            return (total, total / 2);
        }
    }

    (16 * 1024 * MIB, 8 * 1024 * MIB)
}

fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    let mut free: u64 = 0;
    let mut buffers: u64 = 0;
    let mut cached: u64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            const KB_TO_BYTES: u64 = 1024;
            let value: u64 = parts[1].parse::<u64>().unwrap_or(0) * KB_TO_BYTES;
            match parts[0] {
                "MemTotal:" => total = value,
                "MemAvailable:" => available = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// Resident set size of the agent process, 0 when unknown.
fn own_resident_set_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss(&status))
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
