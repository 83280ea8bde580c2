//! Configuration management for strikegate.
//!
//! The configuration file is JSON with a `default` policy and a `domains`
//! map. The daemon itself only interprets `lockout_period` and
//! `excuse_first_timeout`; the remaining per-domain fields are parsed and
//! retained for front-end consumption.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// X-Forwarded-For handling options, forwarded to the front-end.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct XffHandling {
    pub enabled: bool,
    pub header_name: String,
    pub recursive: bool,
    pub trusted_proxy_sources: Vec<String>,
    pub custom_proxies: Vec<String>,
}

/// Per-domain configuration.
///
/// Numeric fields are optional so that an absent field can inherit the
/// default while an explicit `0` keeps its meaning (`lockout_period: 0`
/// is a permanent lockout, not "unset").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DomainConfig {
    pub pow_difficulty: Option<u32>,
    pub hmac_secret: String,
    pub hmac_secret_old: Option<String>,
    pub secret_rotation_expires: Option<DateTime<Utc>>,
    pub cookie_duration: Option<u64>,
    /// Lockout in minutes; 0 means a permanent block.
    pub lockout_period: Option<u64>,
    pub excuse_first_timeout: bool,
    pub exempt_paths: Vec<String>,
    pub restricted_paths: HashMap<String, Vec<String>>,
    pub xff_handling: Option<XffHandling>,
}

/// Fallback policy applied to domains without their own entry and to
/// per-domain fields left unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DefaultConfig {
    pub pow_difficulty: u32,
    pub cookie_duration: u64,
    pub lockout_period: u64,
    pub excuse_first_timeout: bool,
    pub xff_handling: XffHandling,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub default: DefaultConfig,
    pub domains: HashMap<String, DomainConfig>,
}

/// The two fields the strike tracker needs, resolved against defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikePolicy {
    /// Lockout in minutes; 0 means a permanent block.
    pub lockout_period: u64,
    pub excuse_first_timeout: bool,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Resolve the strike policy for `domain`, falling back to the
    /// default policy when the domain has no entry of its own.
    pub fn policy_for(&self, domain: &str) -> StrikePolicy {
        match self.domains.get(domain) {
            Some(d) => StrikePolicy {
                lockout_period: d.lockout_period.unwrap_or(self.default.lockout_period),
                excuse_first_timeout: d.excuse_first_timeout,
            },
            None => StrikePolicy {
                lockout_period: self.default.lockout_period,
                excuse_first_timeout: self.default.excuse_first_timeout,
            },
        }
    }
}
