//! # strikegate - IP-strike enforcement for proof-of-work challenges
//!
//! A long-running privileged daemon behind a per-domain proof-of-work
//! challenge system. The front-end reports per-request outcomes over a
//! local Unix socket; strikegate counts consecutive failures per
//! (IP, domain), applies a three-strike rule with a first-timeout-forgiven
//! policy, and on the third strike drops the offender into a
//! kernel-resident address set so its packets never reach userspace again.
//! Temporary blocks expire after a domain-specific lockout; permanent
//! blocks never do. Strikes and blocks are persisted so the daemon
//! survives restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        strikegated                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Intake (tokio UnixListener)                                 │
//! │    └── newline-JSON failure/success reports                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Tracker (RwLock index + SQLite)                             │
//! │    └── three-strike decisions, excusals, expiry              │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Blocklist (logical sets + temporary shards)                 │
//! │    └── permanent / whitelist / search-engines / temporary-N  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Firewall (trait over ipset + nft/iptables)                  │
//! │    ├── nftables backend (preferred)                          │
//! │    └── iptables backend (legacy)                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Sweeper (60s interval) · Metrics (axum /metrics, /health)   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod blocklist;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod intake;
pub mod lock;
pub mod metrics;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod tracker;
