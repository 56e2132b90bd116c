//! External command execution.
//!
//! Every backend talks to its runtime through a [`CommandRunner`]. The runner
//! spawns the process, drains stdout and stderr to end-of-stream and reports
//! the exit code without interpreting it. Callers decide what a non-zero exit
//! means.
//!
//! Each invocation is bounded by an [`OperationContext`]: when the timeout
//! elapses or the cancellation token fires, the child is killed and the call
//! fails with [`AgentError::Execution`].

use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};

/// Default bound for a single lifecycle operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout and cancellation scope for one lifecycle operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    timeout: Duration,
    cancel: CancellationToken,
}

impl OperationContext {
    /// Create a context with the given timeout and a fresh token.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Create a context bound to an existing cancellation token.
    pub fn with_cancellation(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every operation running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_TIMEOUT)
    }
}

/// A program and its arguments. No shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl ExecutionResult {
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Exit code; -1 when the process was terminated by a signal.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec, ctx: &OperationContext) -> Result<ExecutionResult>;
}

/// Runs commands as child processes of the agent.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec, ctx: &OperationContext) -> Result<ExecutionResult> {
        debug!(command = %command, timeout_secs = ctx.timeout().as_secs(), "Running command");

        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Execution(format!("failed to spawn `{command}`: {e}")))?;

        // Dropping the wait future on timeout/cancel drops the child, which
        // kills it (kill_on_drop).
        let output = tokio::select! {
            output = child.wait_with_output() => output
                .map_err(|e| AgentError::Execution(format!("failed to read output of `{command}`: {e}")))?,
            _ = tokio::time::sleep(ctx.timeout()) => {
                warn!(command = %command, timeout_secs = ctx.timeout().as_secs(), "Command timed out, killing");
                return Err(AgentError::Execution(format!(
                    "`{command}` timed out after {:?}",
                    ctx.timeout()
                )));
            }
            _ = ctx.cancellation_token().cancelled() => {
                warn!(command = %command, "Command cancelled, killing");
                return Err(AgentError::Execution(format!("`{command}` was cancelled")));
            }
        };

        let result = ExecutionResult::new(
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );

        debug!(
            command = %command,
            exit_code = result.exit_code(),
            stdout = %result.stdout(),
            stderr = %result.stderr(),
            "Command finished"
        );

        Ok(result)
    }
}

/// Replays scripted results and records every invocation.
///
/// Used by tests and local development where the real tools are absent.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    responses: Mutex<VecDeque<std::result::Result<ExecutionResult, String>>>,
    invocations: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finished command result.
    pub fn push_output(&self, exit_code: i32, stdout: &str, stderr: &str) -> &Self {
        self.responses
            .lock()
            .push_back(Ok(ExecutionResult::new(exit_code, stdout, stderr)));
        self
    }

    /// Queue a spawn/I/O failure.
    pub fn push_failure(&self, message: &str) -> &Self {
        self.responses.lock().push_back(Err(message.to_string()));
        self
    }

    /// Commands run so far, in order.
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Responses not yet consumed.
    pub fn pending(&self) -> usize {
        self.responses.lock().len()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec, ctx: &OperationContext) -> Result<ExecutionResult> {
        self.invocations.lock().push(command.clone());

        if ctx.is_cancelled() {
            return Err(AgentError::Execution(format!("`{command}` was cancelled")));
        }

        match self.responses.lock().pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(AgentError::Execution(message)),
            None => Err(AgentError::Execution(format!(
                "no scripted response for `{command}`"
            ))),
        }
    }
}
