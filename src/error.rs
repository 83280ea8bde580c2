//! Error types for strikegate.

use thiserror::Error;

/// Errors surfaced by the firewall driver.
///
/// Every kernel-tool invocation is classified into one of these so callers
/// can tell a missing binary apart from a tool that ran and refused.
#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("no firewall backend available (tried nftables and iptables)")]
    Unavailable,

    #[error("{tool} not found in PATH")]
    ToolMissing { tool: String },

    #[error("{tool} exited with status {code:?}: {stderr}")]
    CommandFailed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse {tool} output: {detail}")]
    ParseFailure { tool: String, detail: String },
}

impl FirewallError {
    /// Classify an I/O error from spawning `tool`.
    pub fn from_spawn(tool: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            FirewallError::ToolMissing {
                tool: tool.to_string(),
            }
        } else {
            FirewallError::CommandFailed {
                tool: tool.to_string(),
                code: None,
                stderr: err.to_string(),
            }
        }
    }
}
