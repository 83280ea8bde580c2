//! Command execution boundary for the kernel tooling.
//!
//! Everything strikegate asks of `ipset`, `nft` and `iptables` passes
//! through [`CommandExecutor`]. Failures are classified into
//! [`FirewallError`] right here at the boundary: a binary that cannot be
//! spawned surfaces as `ToolMissing` before any caller sees a raw I/O
//! error, and both output streams are captured for diagnostics. The
//! firewall driver is tested against a mock of this trait, so nothing
//! above this module ever has to run the real tools.

use std::io::Write;
use std::process::{Command, Output, Stdio};

#[cfg(test)]
use mockall::automock;

use crate::error::FirewallError;

/// Output captured from a tool invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the tool exited with status 0.
    pub success: bool,
    pub code: Option<i32>,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

/// Trait for kernel-tool invocation, injectable for testing.
///
/// An `Ok(CommandOutput)` means the tool ran to completion, successfully
/// or not; an `Err` means it could not be run at all. Arguments are owned
/// strings because mockall cannot express the lifetimes of `&[&str]`.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run a tool to completion, capturing both output streams.
    fn execute(&self, tool: &str, args: &[String]) -> Result<CommandOutput, FirewallError>;

    /// Run a tool with `stdin` written to its standard input.
    fn execute_with_stdin(
        &self,
        tool: &str,
        args: &[String],
        stdin: &str,
    ) -> Result<CommandOutput, FirewallError>;
}

/// Executor backed by real system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Single spawn path for both trait methods.
    fn spawn_capture(
        &self,
        tool: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, FirewallError> {
        let mut command = Command::new(tool);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| FirewallError::from_spawn(tool, e))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .map_err(|e| FirewallError::from_spawn(tool, e))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| FirewallError::from_spawn(tool, e))?;
        Ok(output.into())
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, tool: &str, args: &[String]) -> Result<CommandOutput, FirewallError> {
        self.spawn_capture(tool, args, None)
    }

    fn execute_with_stdin(
        &self,
        tool: &str,
        args: &[String],
        stdin: &str,
    ) -> Result<CommandOutput, FirewallError> {
        self.spawn_capture(tool, args, Some(stdin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_binary_classifies_as_tool_missing() {
        let executor = RealCommandExecutor::new();
        let err = executor.execute("strikegate-no-such-tool", &[]).unwrap_err();
        assert!(
            matches!(err, FirewallError::ToolMissing { ref tool } if tool == "strikegate-no-such-tool")
        );
    }

    #[test]
    fn nonzero_exit_is_a_completed_run_with_captured_streams() {
        let executor = RealCommandExecutor::new();
        let args = vec!["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()];

        // The tool ran, so this is Ok even though the tool failed; the
        // driver decides what a nonzero exit means.
        let output = executor.execute("sh", &args).unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn stdin_reaches_the_child() {
        let executor = RealCommandExecutor::new();
        let args = vec!["-c".to_string(), "tr a-z A-Z".to_string()];
        let output = executor
            .execute_with_stdin("sh", &args, "add element blocked")
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "ADD ELEMENT BLOCKED");
    }

    #[test]
    fn stdin_path_still_classifies_missing_binaries() {
        let executor = RealCommandExecutor::new();
        let err = executor
            .execute_with_stdin("strikegate-no-such-tool", &[], "script")
            .unwrap_err();
        assert!(matches!(err, FirewallError::ToolMissing { .. }));
    }

    #[test]
    fn mock_propagates_classified_errors() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|tool, _| {
                Err(FirewallError::ToolMissing {
                    tool: tool.to_string(),
                })
            });

        let err = mock.execute("ipset", &[]).unwrap_err();
        assert!(matches!(err, FirewallError::ToolMissing { ref tool } if tool == "ipset"));
    }
}
