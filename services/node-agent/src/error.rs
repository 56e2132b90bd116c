//! Error types for workload lifecycle operations.

use thiserror::Error;

/// Errors surfaced by the command runner and workload backends.
#[derive(Debug, Error)]
pub enum AgentError {
    /// External tool could not be spawned, failed, timed out, or reported
    /// that the workload did not reach the requested state.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Tool output did not match the expected grammar.
    #[error("could not parse {context}: {raw:?}")]
    Parse {
        context: &'static str,
        raw: String,
    },

    /// Not enough memory to admit a workload start.
    #[error("insufficient memory: {required} bytes required, {available} bytes available")]
    Resource { required: u64, available: u64 },

    /// Invalid configuration or unknown application id.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The backend's daemon is unreachable.
    #[error("not connected: {0}")]
    Connection(String),
}

impl AgentError {
    /// Build a parse error carrying the offending text.
    pub fn parse(context: &'static str, raw: impl Into<String>) -> Self {
        AgentError::Parse {
            context,
            raw: raw.into(),
        }
    }

    /// Raw tool output attached to a parse error.
    pub fn raw_output(&self) -> Option<&str> {
        match self {
            AgentError::Parse { raw, .. } => Some(raw),
            _ => None,
        }
    }

    pub fn is_execution(&self) -> bool {
        matches!(self, AgentError::Execution(_))
    }

    pub fn is_parse(&self) -> bool {
        matches!(self, AgentError::Parse { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, AgentError::Resource { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, AgentError::Config(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, AgentError::Connection(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_keeps_raw_text() {
        let err = AgentError::parse("start output", "garbage, text");
        assert!(err.is_parse());
        assert_eq!(err.raw_output(), Some("garbage, text"));
        assert!(err.to_string().contains("garbage, text"));
    }

    #[test]
    fn test_resource_error_message() {
        let err = AgentError::Resource {
            required: 256,
            available: 100,
        };
        assert!(err.is_resource());
        assert_eq!(
            err.to_string(),
            "insufficient memory: 256 bytes required, 100 bytes available"
        );
    }
}
