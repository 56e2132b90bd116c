//! Grammar for the unikernel control tool's diagnostic output.
//!
//! The tool reports the outcome of `start` and `stop` as a single
//! comma-separated line on stderr, prefixed by a log timestamp:
//!
//! ```text
//! 2017/05/28 20:22:24 Application unikernel started: true, IP: 192.168.122.89, Info: Successful start
//! 2017/05/28 20:25:02 Application unikernel stopped: true, Info: Successfully stopped Application (HelloWorldApp)
//! ```
//!
//! Start lines have three fields (flag, address, info), stop lines two
//! (flag, info). The info field is free text and may itself contain commas.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{AgentError, Result};
use crate::status::WorkloadState;

/// Trailing boolean of the first field.
static FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?P<flag>true|false)\s*$").expect("valid flag regex"));

/// Address field: `IP: <address>`, address possibly empty.
static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^IP:(?:\s+(?P<address>\S+))?").expect("valid address regex"));

/// Info text marking an idempotent start.
const ALREADY_RUNNING: &str = "already running";

/// Info text marking a confirmed stop.
const SUCCESSFULLY_STOPPED: &str = "Successfully stopped";

/// Parsed result of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub started: bool,
    pub address: Option<String>,
    pub info: String,
}

impl StartReport {
    pub fn already_running(&self) -> bool {
        self.info.contains(ALREADY_RUNNING)
    }
}

/// What a start attempt amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Freshly started at the given address.
    Started { address: String },
    /// Instance was already up; nothing changed.
    AlreadyRunning,
}

/// Parsed result of `stop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Flag reported by the tool, if the first field carries one.
    pub stopped: Option<bool>,
    pub info: String,
}

impl StopReport {
    pub fn confirmed(&self) -> bool {
        self.info.contains(SUCCESSFULLY_STOPPED)
    }
}

/// Parse the stderr of `start`.
pub fn parse_start(stderr: &str) -> Result<StartReport> {
    let line = result_line(stderr);
    let fields: Vec<&str> = line.splitn(3, ',').collect();
    if fields.len() < 3 {
        return Err(AgentError::parse("start output", stderr));
    }

    let started = parse_flag(fields[0]).ok_or_else(|| AgentError::parse("start output", stderr))?;

    let address_field = fields[1].trim();
    let address = ADDRESS_RE
        .captures(address_field)
        .and_then(|caps| caps.name("address"))
        .map(|m| m.as_str().trim().to_string());

    // A started instance is only reachable through its address, so identity
    // bookkeeping requires one.
    if started && address.is_none() {
        return Err(AgentError::parse("start address", stderr));
    }

    Ok(StartReport {
        started,
        address,
        info: fields[2].trim().to_string(),
    })
}

/// Interpret a start report.
///
/// A start that did not happen because the instance is already running is a
/// successful no-op; any other refusal is an execution error.
pub fn start_outcome(report: StartReport, raw: &str) -> Result<StartOutcome> {
    if report.started {
        return match report.address {
            Some(address) => Ok(StartOutcome::Started { address }),
            None => Err(AgentError::parse("start address", raw)),
        };
    }

    if report.already_running() {
        return Ok(StartOutcome::AlreadyRunning);
    }

    Err(AgentError::Execution(format!(
        "workload not started: {}",
        report.info
    )))
}

/// Parse the stderr of `stop`.
pub fn parse_stop(stderr: &str) -> Result<StopReport> {
    let line = result_line(stderr);
    let fields: Vec<&str> = line.splitn(2, ',').collect();
    if fields.len() < 2 {
        return Err(AgentError::parse("stop output", stderr));
    }

    Ok(StopReport {
        stopped: parse_flag(fields[0]),
        info: fields[1].trim().to_string(),
    })
}

/// Interpret the stdout of `status`.
pub fn parse_status(stdout: &str) -> WorkloadState {
    if stdout.contains("RUNNING") {
        WorkloadState::Running
    } else {
        WorkloadState::Stopped
    }
}

/// The tool may log progress lines before the result; the result is the
/// last non-empty line.
fn result_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

fn parse_flag(field: &str) -> Option<bool> {
    FLAG_RE
        .captures(field.trim())
        .and_then(|caps| caps.name("flag"))
        .map(|m| m.as_str() == "true")
}
