//! nftables drop-rule installation.
//!
//! All sets live in a single `inet strikegate` table with one input
//! chain. Each logical set gets a named nft set mirroring the ipset and
//! one `saddr @set drop` rule; existing sets and rules are left alone so
//! re-running never duplicates anything.

use tracing::{debug, info};

use super::argv;
use crate::error::FirewallError;
use crate::exec::{CommandExecutor, CommandOutput};

pub(super) const TABLE_NAME: &str = "strikegate";

fn run<E: CommandExecutor>(executor: &E, args: &[&str]) -> Result<CommandOutput, FirewallError> {
    executor.execute("nft", &argv(args))
}

/// Ensure the table and input chain exist.
fn ensure_table<E: CommandExecutor>(executor: &E) -> Result<(), FirewallError> {
    let exists = run(executor, &["list", "table", "inet", TABLE_NAME])?.success;
    if exists {
        return Ok(());
    }

    let script = format!(
        "table inet {TABLE_NAME} {{\n\
         \tchain input {{\n\
         \t\ttype filter hook input priority filter; policy accept;\n\
         \t}}\n\
         }}\n"
    );
    let output = executor.execute_with_stdin("nft", &argv(&["-f", "-"]), &script)?;
    if !output.success {
        return Err(FirewallError::CommandFailed {
            tool: "nft".to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    info!(table = TABLE_NAME, "nftables_table_created");
    Ok(())
}

pub(super) fn install_drop_rules<E: CommandExecutor>(
    executor: &E,
    set_names: &[String],
) -> Result<(), FirewallError> {
    ensure_table(executor)?;

    // One listing answers "which rules are already installed" for every
    // set in this batch.
    let table = run(executor, &["list", "table", "inet", TABLE_NAME])?;
    let listing = if table.success {
        table.stdout
    } else {
        String::new()
    };

    for set in set_names {
        // Mirror the ipset as a named nft set; an existing set is fine.
        let created = run(
            executor,
            &[
                "add", "set", "inet", TABLE_NAME, set, "{", "type", "ipv4_addr", ";", "flags",
                "interval", ";", "}",
            ],
        )?;
        if !created.success {
            debug!(set, "nftables_set_exists");
        }

        if listing.contains(&format!("@{set}")) {
            debug!(set, "drop_rule_present");
            continue;
        }

        let rule = run(
            executor,
            &[
                "add",
                "rule",
                "inet",
                TABLE_NAME,
                "input",
                "ip",
                "saddr",
                &format!("@{set}"),
                "drop",
            ],
        )?;
        if rule.success {
            info!(set, backend = "nftables", "drop_rule_installed");
        } else {
            // A lost race with a concurrent add is harmless.
            debug!(set, stderr = %rule.stderr.trim(), "nftables_rule_add_refused");
        }
    }

    Ok(())
}
