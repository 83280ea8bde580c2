//! iptables drop-rule installation (legacy backend).
//!
//! One `-m set --match-set <name> src -j DROP` rule per logical set at
//! the head of INPUT. `-C` probes for an existing rule first, so
//! re-running never inserts a duplicate.

use tracing::info;

use super::argv;
use crate::error::FirewallError;
use crate::exec::{CommandExecutor, CommandOutput};

fn run<E: CommandExecutor>(executor: &E, args: &[&str]) -> Result<CommandOutput, FirewallError> {
    executor.execute("iptables", &argv(args))
}

pub(super) fn install_drop_rules<E: CommandExecutor>(
    executor: &E,
    set_names: &[String],
) -> Result<(), FirewallError> {
    for set in set_names {
        let exists = run(
            executor,
            &["-C", "INPUT", "-m", "set", "--match-set", set, "src", "-j", "DROP"],
        )?
        .success;
        if exists {
            continue;
        }

        let output = run(
            executor,
            &["-I", "INPUT", "1", "-m", "set", "--match-set", set, "src", "-j", "DROP"],
        )?;
        if !output.success {
            return Err(FirewallError::CommandFailed {
                tool: "iptables".to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        info!(set, backend = "iptables", "drop_rule_installed");
    }
    Ok(())
}
