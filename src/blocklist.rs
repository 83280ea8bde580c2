//! Logical-set lifecycle: fixed sets, temporary shards, spill policy.
//!
//! The manager owns the logical-set namespace. Permanent, whitelist and
//! search-engine sets are created once at startup; temporary blocks go
//! into a sequence of bounded shards, spilling into a freshly created
//! shard when the active one fills. Shard bookkeeping lives behind its
//! own mutex and never touches the tracker's lock.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::FirewallError;
use crate::firewall::Firewall;

pub const PERMANENT_SET: &str = "strikegate-permanent";
pub const WHITELIST_SET: &str = "strikegate-whitelist";
pub const SEARCH_ENGINE_SET: &str = "strikegate-search-engines";
pub const TEMPORARY_SET_PREFIX: &str = "strikegate-temporary-";

/// Element ceiling for the permanent, whitelist and search-engine sets.
pub const FIXED_SET_CAPACITY: u32 = 50_000;
/// Element ceiling per temporary shard.
pub const TEMPORARY_SET_CAPACITY: u32 = 20_000;

fn temporary_set_name(index: usize) -> String {
    format!("{TEMPORARY_SET_PREFIX}{index}")
}

/// One line of the initial blacklist file.
#[derive(Debug, Deserialize)]
pub struct BlacklistEntry {
    pub ip_address: String,
    #[serde(default)]
    pub timestamp: String,
    /// Minutes; 0 means a permanent block.
    #[serde(default)]
    pub lockout_period: u64,
}

#[derive(Debug, Default)]
struct ShardState {
    temporary_sets: Vec<String>,
    /// Index of the current write target in `temporary_sets`.
    active: usize,
}

/// Maps logical block categories onto kernel sets.
pub struct BlocklistManager {
    fw: Arc<dyn Firewall>,
    shards: Mutex<ShardState>,
}

impl BlocklistManager {
    pub fn new(fw: Arc<dyn Firewall>) -> Self {
        Self {
            fw,
            shards: Mutex::new(ShardState::default()),
        }
    }

    /// Create the fixed sets and the first temporary shard, then install
    /// drop rules for the enforcing sets. Any failure here is fatal: the
    /// daemon must not start without its kernel sets.
    pub async fn initialize(&self) -> Result<()> {
        self.fw
            .create_set(PERMANENT_SET, FIXED_SET_CAPACITY)
            .await
            .context("failed to create permanent set")?;
        self.fw
            .create_set(WHITELIST_SET, FIXED_SET_CAPACITY)
            .await
            .context("failed to create whitelist set")?;
        self.fw
            .create_set(SEARCH_ENGINE_SET, FIXED_SET_CAPACITY)
            .await
            .context("failed to create search engine set")?;

        {
            let mut shards = self.shards.lock().await;
            self.create_temporary(&mut shards, 0)
                .await
                .context("failed to create temporary set")?;
        }

        self.fw
            .install_drop_rules(&[PERMANENT_SET.to_string(), temporary_set_name(0)])
            .await
            .context("failed to install drop rules")?;

        info!(
            permanent_set = PERMANENT_SET,
            whitelist_set = WHITELIST_SET,
            search_engine_set = SEARCH_ENGINE_SET,
            temporary_sets = 1usize,
            "blocklist_initialized"
        );
        Ok(())
    }

    async fn create_temporary(
        &self,
        shards: &mut ShardState,
        index: usize,
    ) -> Result<(), FirewallError> {
        let name = temporary_set_name(index);
        self.fw.create_set(&name, TEMPORARY_SET_CAPACITY).await?;
        shards.temporary_sets.push(name.clone());
        info!(set = %name, "temporary_set_created");
        Ok(())
    }

    /// Name of a temporary set with room for another block.
    ///
    /// The active shard is reused while it has capacity (or while its
    /// size cannot be read). When full, the write target advances,
    /// creating the next shard and its drop rule on first use; if that
    /// creation fails the manager falls back to shard 0.
    pub async fn writable_temporary(&self) -> String {
        let mut shards = self.shards.lock().await;

        let current = shards.temporary_sets[shards.active].clone();
        match self.fw.size(&current).await {
            Ok(size) if size >= TEMPORARY_SET_CAPACITY as usize => {}
            _ => return current,
        }

        shards.active += 1;
        if shards.active >= shards.temporary_sets.len() {
            let index = shards.temporary_sets.len();
            if let Err(e) = self.create_temporary(&mut shards, index).await {
                error!(error = %e, "temporary_set_create_failed");
                shards.active = 0;
                return shards.temporary_sets[0].clone();
            }
            let name = shards.temporary_sets[index].clone();
            if let Err(e) = self.fw.install_drop_rules(&[name]).await {
                warn!(error = %e, "drop_rule_install_failed");
            }
        }

        shards.temporary_sets[shards.active].clone()
    }

    pub async fn add(&self, set: &str, ip: &str) -> Result<(), FirewallError> {
        self.fw.add(set, ip).await
    }

    pub async fn remove(&self, set: &str, ip: &str) -> Result<(), FirewallError> {
        self.fw.remove(set, ip).await
    }

    /// Load prior block records from a newline-JSON file.
    ///
    /// A missing file is fine (nothing was blocked yet). Malformed lines
    /// and invalid addresses are warned about and skipped; the load never
    /// aborts over one bad record.
    pub async fn load_initial_blacklist(&self, path: &Path) -> Result<()> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read blacklist {}", path.display()))
            }
        };

        let mut permanent = 0u64;
        let mut temporary = 0u64;

        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }

            let entry: BlacklistEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(line, error = %e, "blacklist_parse_error");
                    continue;
                }
            };

            // hash:net sets take plain addresses and CIDR ranges;
            // anything else never reaches the kernel tooling.
            let well_formed = entry.ip_address.parse::<IpNet>().is_ok()
                || entry.ip_address.parse::<IpAddr>().is_ok();
            if !well_formed {
                warn!(ip = %entry.ip_address, "blacklist_invalid_address");
                continue;
            }

            let set_name = if entry.lockout_period == 0 {
                permanent += 1;
                PERMANENT_SET.to_string()
            } else {
                temporary += 1;
                self.writable_temporary().await
            };

            if let Err(e) = self.add(&set_name, &entry.ip_address).await {
                error!(ip = %entry.ip_address, set = %set_name, error = %e, "blacklist_add_failed");
            }
        }

        info!(permanent, temporary, "blacklist_loaded");
        Ok(())
    }

    pub async fn permanent_size(&self) -> usize {
        self.fw.size(PERMANENT_SET).await.unwrap_or(0)
    }

    /// Sum of the sizes of all temporary shards.
    pub async fn total_temporary_size(&self) -> usize {
        let names: Vec<String> = {
            let shards = self.shards.lock().await;
            shards.temporary_sets.clone()
        };
        let mut total = 0;
        for name in names {
            total += self.fw.size(&name).await.unwrap_or(0);
        }
        total
    }

    pub async fn whitelist_size(&self) -> usize {
        self.fw.size(WHITELIST_SET).await.unwrap_or(0)
    }

    pub async fn search_engine_size(&self) -> usize {
        self.fw.size(SEARCH_ENGINE_SET).await.unwrap_or(0)
    }
}
