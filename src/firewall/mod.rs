//! Firewall driver: kernel address sets plus per-backend drop rules.
//!
//! Set membership is always managed through `ipset`; only the drop rules
//! differ between the nftables and iptables backends. The driver is a
//! thin typed adapter, one function per verb, no retries; every
//! invocation captures stdout and stderr for diagnostics.

mod iptables;
mod nftables;

use async_trait::async_trait;
use tracing::warn;

use crate::error::FirewallError;
use crate::exec::{CommandExecutor, CommandOutput, RealCommandExecutor};

/// Build the owned argv the executor trait wants.
fn argv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Detected packet-filter backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Nftables,
    Iptables,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Nftables => write!(f, "nftables"),
            Backend::Iptables => write!(f, "iptables"),
        }
    }
}

/// Kernel-set and drop-rule operations.
///
/// All operations are idempotent where the underlying tools permit it:
/// `create_set` tolerates an existing set, `add`/`remove` tolerate
/// present/absent members, and `install_drop_rules` never duplicates a
/// rule. Nothing in this layer retries.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// Ensure a set exists with at least the requested capacity.
    async fn create_set(&self, name: &str, max_elements: u32) -> Result<(), FirewallError>;

    /// Add an address to a set.
    async fn add(&self, set: &str, ip: &str) -> Result<(), FirewallError>;

    /// Remove an address from a set. Absence is not an error.
    async fn remove(&self, set: &str, ip: &str) -> Result<(), FirewallError>;

    /// List the members of a set.
    async fn list(&self, set: &str) -> Result<Vec<String>, FirewallError>;

    /// Number of members in a set.
    async fn size(&self, set: &str) -> Result<usize, FirewallError>;

    /// Ensure packets sourced from each named set are dropped in the
    /// input path.
    async fn install_drop_rules(&self, sets: &[String]) -> Result<(), FirewallError>;

    /// Remove all members from a set.
    async fn flush(&self, set: &str) -> Result<(), FirewallError>;

    /// Destroy a set entirely.
    async fn destroy(&self, set: &str) -> Result<(), FirewallError>;
}

/// Shell-out driver over `ipset` and the detected packet-filter tool.
#[derive(Debug)]
pub struct FirewallDriver<E: CommandExecutor = RealCommandExecutor> {
    backend: Backend,
    executor: E,
}

impl FirewallDriver<RealCommandExecutor> {
    /// Probe for an available backend, preferring nftables.
    pub fn detect() -> Result<Self, FirewallError> {
        Self::detect_with(RealCommandExecutor::new())
    }
}

impl<E: CommandExecutor> FirewallDriver<E> {
    /// Probe for a backend using the given executor.
    pub fn detect_with(executor: E) -> Result<Self, FirewallError> {
        let backend = detect_backend(&executor)?;
        Ok(Self { backend, executor })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    fn run(&self, tool: &str, args: &[&str]) -> Result<CommandOutput, FirewallError> {
        self.executor.execute(tool, &argv(args))
    }

    fn run_checked(&self, tool: &str, args: &[&str]) -> Result<CommandOutput, FirewallError> {
        let output = self.run(tool, args)?;
        if output.success {
            Ok(output)
        } else {
            Err(FirewallError::CommandFailed {
                tool: tool.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Probe for an available backend, preferring nftables.
fn detect_backend<E: CommandExecutor>(executor: &E) -> Result<Backend, FirewallError> {
    let probe = |tool: &str, args: &[&str]| {
        executor
            .execute(tool, &argv(args))
            .map(|o| o.success)
            .unwrap_or(false)
    };

    if probe("nft", &["list", "tables"]) {
        return Ok(Backend::Nftables);
    }
    if probe("iptables", &["-L", "-n"]) {
        return Ok(Backend::Iptables);
    }
    Err(FirewallError::Unavailable)
}

#[async_trait]
impl<E: CommandExecutor> Firewall for FirewallDriver<E> {
    async fn create_set(&self, name: &str, max_elements: u32) -> Result<(), FirewallError> {
        self.run_checked(
            "ipset",
            &[
                "create",
                name,
                "hash:net",
                "maxelem",
                &max_elements.to_string(),
                "-exist",
            ],
        )?;
        Ok(())
    }

    async fn add(&self, set: &str, ip: &str) -> Result<(), FirewallError> {
        self.run_checked("ipset", &["add", set, ip, "-exist"])?;
        Ok(())
    }

    async fn remove(&self, set: &str, ip: &str) -> Result<(), FirewallError> {
        // `-exist` makes removal of an absent member succeed.
        let output = self.run("ipset", &["del", set, ip, "-exist"])?;
        if !output.success {
            warn!(set, ip, stderr = %output.stderr.trim(), "ipset_remove_failed");
            return Err(FirewallError::CommandFailed {
                tool: "ipset".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn list(&self, set: &str) -> Result<Vec<String>, FirewallError> {
        let output = self.run_checked("ipset", &["list", set])?;
        parse_members(&output.stdout)
    }

    async fn size(&self, set: &str) -> Result<usize, FirewallError> {
        Ok(self.list(set).await?.len())
    }

    async fn install_drop_rules(&self, sets: &[String]) -> Result<(), FirewallError> {
        match self.backend {
            Backend::Nftables => nftables::install_drop_rules(&self.executor, sets),
            Backend::Iptables => iptables::install_drop_rules(&self.executor, sets),
        }
    }

    async fn flush(&self, set: &str) -> Result<(), FirewallError> {
        self.run_checked("ipset", &["flush", set])?;
        Ok(())
    }

    async fn destroy(&self, set: &str) -> Result<(), FirewallError> {
        self.run_checked("ipset", &["destroy", set])?;
        Ok(())
    }
}

/// Parse the `Members:` section of `ipset list` output.
fn parse_members(output: &str) -> Result<Vec<String>, FirewallError> {
    let mut members = Vec::new();
    let mut in_members = false;

    for line in output.lines() {
        let line = line.trim();
        if line == "Members:" {
            in_members = true;
            continue;
        }
        if in_members && !line.is_empty() {
            members.push(line.to_string());
        }
    }

    if !in_members {
        return Err(FirewallError::ParseFailure {
            tool: "ipset".to_string(),
            detail: "no Members: section in list output".to_string(),
        });
    }
    Ok(members)
}

/// Check that the process runs with effective UID 0.
///
/// Manipulating kernel sets and filter rules requires root (or
/// CAP_NET_ADMIN); failing early gives a clearer error than a cascade of
/// tool failures.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid() reads the effective user ID, has no preconditions,
    // never fails, and does not modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "strikegated requires root privileges to manage kernel address sets. \
             Run as root or grant CAP_NET_ADMIN."
        )
    }
    Ok(())
}
