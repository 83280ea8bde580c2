//! The strike state machine: three-strike decisions, expiry, blocking.
//!
//! The tracker owns the in-memory index of active strikes. All mutation
//! happens under its writer lock, which keeps the three-strike decision
//! linearizable per (IP, domain) and keeps the decision ordered with the
//! kernel mutation in the block path. Lock order is tracker first, then
//! blocklist manager, never the reverse.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::blocklist::{BlocklistManager, PERMANENT_SET};
use crate::config::{Config, StrikePolicy};
use crate::metrics::Metrics;
use crate::store::{BlockRecord, Store};

/// Strikes at or above this count trigger a block.
pub const STRIKE_THRESHOLD: u32 = 3;

/// Failure reason eligible for the first-timeout excusal.
pub const TIMEOUT_REASON: &str = "timeout";

const BLOCK_REASON: &str = "3_strikes";

/// Index key. A struct rather than an `"ip:domain"` string: the string
/// form is lossy if a domain ever contained a colon.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrikeKey {
    pub ip: String,
    pub domain: String,
}

/// Active strike record for one (IP, domain) pair.
#[derive(Debug, Clone)]
pub struct Strike {
    pub ip: String,
    pub domain: String,
    pub strike_count: u32,
    pub first_failure: DateTime<Utc>,
    pub last_failure: DateTime<Utc>,
    /// Once true, no further timeouts are excused for this key.
    pub first_timeout_excused: bool,
    /// `None` for permanent-lockout domains; the record lives until a
    /// block overwrites it or a success deletes it.
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct Tracker {
    index: RwLock<HashMap<StrikeKey, Strike>>,
    store: Store,
    blocklist: Arc<BlocklistManager>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl Tracker {
    /// Build the tracker, replaying unexpired strikes from the store.
    ///
    /// Replay does not reissue blocks: `blocked_ips` is the source of
    /// truth for what already sits in kernel sets, rebuilt across
    /// restart from the blacklist file and the sets themselves. A failed
    /// replay starts the daemon with an empty index rather than keeping
    /// it down.
    pub async fn new(
        store: Store,
        config: Arc<Config>,
        blocklist: Arc<BlocklistManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let mut index = HashMap::new();
        match store.load_unexpired_strikes(Utc::now()).await {
            Ok(strikes) => {
                for strike in strikes {
                    let key = StrikeKey {
                        ip: strike.ip.clone(),
                        domain: strike.domain.clone(),
                    };
                    index.insert(key, strike);
                }
            }
            Err(e) => warn!(error = %e, "strikes_load_failed"),
        }
        info!(count = index.len(), "strikes_loaded");

        Self {
            index: RwLock::new(index),
            store,
            blocklist,
            config,
            metrics,
        }
    }

    /// Record a failed challenge for (ip, domain).
    ///
    /// Returns the resulting strike count and whether the IP was blocked
    /// by this call. The first timeout per key may be excused by policy;
    /// an excused failure leaves the count and `last_failure` untouched
    /// but still refreshes the record's expiry.
    pub async fn record_failure(&self, ip: &str, domain: &str, reason: &str) -> (u32, bool) {
        let policy = self.config.policy_for(domain);
        let now = Utc::now();

        let mut index = self.index.write().await;
        let key = StrikeKey {
            ip: ip.to_string(),
            domain: domain.to_string(),
        };
        let strike = index.entry(key).or_insert_with(|| Strike {
            ip: ip.to_string(),
            domain: domain.to_string(),
            strike_count: 0,
            first_failure: now,
            last_failure: now,
            first_timeout_excused: false,
            expires_at: None,
        });

        let excused =
            reason == TIMEOUT_REASON && policy.excuse_first_timeout && !strike.first_timeout_excused;
        if excused {
            strike.first_timeout_excused = true;
            info!(ip, domain, "first_timeout_excused");
        } else {
            strike.strike_count += 1;
            strike.last_failure = now;
        }

        if policy.lockout_period > 0 {
            strike.expires_at = Some(now + Duration::minutes(policy.lockout_period as i64));
        }

        let snapshot = strike.clone();
        if let Err(e) = self.store.upsert_strike(&snapshot).await {
            error!(ip, domain, error = %e, "strike_save_failed");
        }
        self.metrics.record_strike_update();

        warn!(
            ip,
            domain,
            reason,
            strike_count = snapshot.strike_count,
            excused,
            "pow_failure"
        );

        if snapshot.strike_count >= STRIKE_THRESHOLD {
            let blocked = self.block(ip, domain, &policy, now).await;
            return (snapshot.strike_count, blocked);
        }

        (snapshot.strike_count, false)
    }

    /// Record a successful challenge: the strike record is deleted
    /// entirely. Idempotent, and deliberately does not touch kernel
    /// sets; an already-blocked IP stays blocked until its lockout
    /// expires.
    pub async fn record_success(&self, ip: &str, domain: &str) {
        let mut index = self.index.write().await;
        let key = StrikeKey {
            ip: ip.to_string(),
            domain: domain.to_string(),
        };
        if index.remove(&key).is_some() {
            if let Err(e) = self.store.delete_strike(ip, domain).await {
                error!(ip, domain, error = %e, "strike_delete_failed");
            }
            info!(ip, domain, "strike_cleared");
        }
    }

    /// Install the block for a strike that reached the threshold.
    ///
    /// Returns whether the kernel add succeeded. On failure nothing is
    /// recorded and the caller reports the IP as not blocked; the strike
    /// stays at its elevated count, so the next failure retries.
    async fn block(&self, ip: &str, domain: &str, policy: &StrikePolicy, now: DateTime<Utc>) -> bool {
        let (set_name, lockout_expires) = if policy.lockout_period == 0 {
            (PERMANENT_SET.to_string(), None)
        } else {
            (
                self.blocklist.writable_temporary().await,
                Some(now + Duration::minutes(policy.lockout_period as i64)),
            )
        };

        if let Err(e) = self.blocklist.add(&set_name, ip).await {
            error!(ip, domain, set = %set_name, error = %e, "kernel_block_failed");
            return false;
        }

        let record = BlockRecord {
            ip: ip.to_string(),
            domain: domain.to_string(),
            blocked_at: now,
            lockout_expires,
            reason: BLOCK_REASON.to_string(),
            logical_set_name: set_name.clone(),
        };
        if let Err(e) = self.store.insert_block(&record).await {
            error!(ip, error = %e, "block_record_failed");
        }
        self.metrics.record_block();

        info!(
            ip,
            domain,
            set = %set_name,
            lockout_period = policy.lockout_period,
            "ip_blocked"
        );
        true
    }

    /// Reap expired strikes and expired blocks.
    pub async fn sweep(&self) {
        self.sweep_at(Utc::now()).await;
    }

    /// Reap everything expired as of `now`. Running this twice with no
    /// intervening mutation is equivalent to running it once.
    pub async fn sweep_at(&self, now: DateTime<Utc>) {
        let mut index = self.index.write().await;

        let expired: Vec<StrikeKey> = index
            .iter()
            .filter(|(_, strike)| strike.expires_at.is_some_and(|at| at < now))
            .map(|(key, _)| key.clone())
            .collect();

        let cleaned = expired.len();
        for key in expired {
            index.remove(&key);
            if let Err(e) = self.store.delete_strike(&key.ip, &key.domain).await {
                error!(ip = %key.ip, domain = %key.domain, error = %e, "strike_delete_failed");
            }
        }

        match self.store.expired_blocks(now).await {
            Ok(blocks) => {
                for block in blocks {
                    // Keep the row if the kernel removal failed, so the
                    // next sweep retries instead of orphaning the entry.
                    if let Err(e) = self
                        .blocklist
                        .remove(&block.logical_set_name, &block.ip)
                        .await
                    {
                        warn!(ip = %block.ip, set = %block.logical_set_name, error = %e, "kernel_unblock_failed");
                        continue;
                    }
                    if let Err(e) = self.store.delete_block(&block.ip).await {
                        error!(ip = %block.ip, error = %e, "block_delete_failed");
                    }
                    info!(ip = %block.ip, set = %block.logical_set_name, "ip_unblocked");
                }
            }
            Err(e) => error!(error = %e, "expired_block_scan_failed"),
        }

        if cleaned > 0 {
            info!(count = cleaned, "expired_strikes_cleaned");
        }
    }

    /// Number of active strike records.
    pub async fn active_strikes(&self) -> usize {
        self.index.read().await.len()
    }

    /// Current strike count for (ip, domain); 0 when absent.
    pub async fn strike_count_for(&self, ip: &str, domain: &str) -> u32 {
        let index = self.index.read().await;
        let key = StrikeKey {
            ip: ip.to_string(),
            domain: domain.to_string(),
        };
        index.get(&key).map_or(0, |strike| strike.strike_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::TEMPORARY_SET_CAPACITY;
    use crate::config::DomainConfig;
    use crate::firewall::memory::MemoryFirewall;

    struct Fixture {
        fw: Arc<MemoryFirewall>,
        store: Store,
        metrics: Arc<Metrics>,
        tracker: Tracker,
    }

    /// Build a tracker over an in-memory firewall and database. Domains
    /// are given as (name, lockout_minutes, excuse_first_timeout).
    async fn setup(domains: &[(&str, u64, bool)]) -> Fixture {
        let fw = Arc::new(MemoryFirewall::new());
        let blocklist = Arc::new(BlocklistManager::new(fw.clone()));
        blocklist.initialize().await.unwrap();

        let mut config = Config::default();
        config.default.lockout_period = 60;
        for (domain, lockout, excuse) in domains {
            config.domains.insert(
                domain.to_string(),
                DomainConfig {
                    lockout_period: Some(*lockout),
                    excuse_first_timeout: *excuse,
                    ..DomainConfig::default()
                },
            );
        }

        let store = Store::open_in_memory().await.unwrap();
        let metrics = Arc::new(Metrics::new());
        let tracker = Tracker::new(
            store.clone(),
            Arc::new(config),
            blocklist,
            metrics.clone(),
        )
        .await;

        Fixture {
            fw,
            store,
            metrics,
            tracker,
        }
    }

    #[tokio::test]
    async fn test_timeout_excused_then_real_failures() {
        let fx = setup(&[("example.com", 30, true)]).await;
        let t = &fx.tracker;

        // First timeout is excused.
        assert_eq!(t.record_failure("1.2.3.4", "example.com", "timeout").await, (0, false));
        // Only one excusal per key lifetime.
        assert_eq!(t.record_failure("1.2.3.4", "example.com", "timeout").await, (1, false));
        assert_eq!(
            t.record_failure("1.2.3.4", "example.com", "invalid_solution").await,
            (2, false)
        );
        let (count, blocked) = t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        assert_eq!((count, blocked), (3, true));

        assert!(fx.fw.contains("strikegate-temporary-0", "1.2.3.4"));
        let block = fx.store.block_for("1.2.3.4").await.unwrap().unwrap();
        assert!(block.logical_set_name.starts_with("strikegate-temporary-"));
        assert!(block.lockout_expires.is_some());
        assert_eq!(block.reason, "3_strikes");
        assert_eq!(fx.metrics.blocks_total(), 1);
        assert_eq!(fx.metrics.strike_updates_total(), 4);
    }

    #[tokio::test]
    async fn test_permanent_lockout_blocks_into_permanent_set() {
        let fx = setup(&[("locked.example", 0, false)]).await;
        let t = &fx.tracker;

        assert_eq!(t.record_failure("5.6.7.8", "locked.example", "invalid_solution").await, (1, false));
        assert_eq!(t.record_failure("5.6.7.8", "locked.example", "invalid_solution").await, (2, false));
        assert_eq!(t.record_failure("5.6.7.8", "locked.example", "invalid_solution").await, (3, true));

        assert!(fx.fw.contains(PERMANENT_SET, "5.6.7.8"));
        let block = fx.store.block_for("5.6.7.8").await.unwrap().unwrap();
        assert_eq!(block.logical_set_name, PERMANENT_SET);
        assert!(block.lockout_expires.is_none());

        // Permanent-lockout strikes have no expiry of their own.
        let strikes = fx.store.load_unexpired_strikes(Utc::now()).await.unwrap();
        assert!(strikes.iter().all(|s| s.expires_at.is_none()));
    }

    #[tokio::test]
    async fn test_success_clears_mid_accrual() {
        let fx = setup(&[("example.com", 30, false)]).await;
        let t = &fx.tracker;

        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        t.record_success("1.2.3.4", "example.com").await;
        assert_eq!(t.strike_count_for("1.2.3.4", "example.com").await, 0);

        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        let (count, blocked) = t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        assert_eq!((count, blocked), (2, false));
    }

    #[tokio::test]
    async fn test_success_resets_excusal_with_the_record() {
        let fx = setup(&[("example.com", 30, true)]).await;
        let t = &fx.tracker;

        assert_eq!(t.record_failure("1.2.3.4", "example.com", "timeout").await, (0, false));
        t.record_success("1.2.3.4", "example.com").await;

        // A fresh record gets a fresh excusal.
        assert_eq!(t.record_failure("1.2.3.4", "example.com", "timeout").await, (0, false));
    }

    #[tokio::test]
    async fn test_record_success_is_idempotent() {
        let fx = setup(&[]).await;
        // Success for an unknown key is silent.
        fx.tracker.record_success("10.0.0.1", "nowhere.example").await;
        fx.tracker.record_success("10.0.0.1", "nowhere.example").await;
        assert_eq!(fx.tracker.active_strikes().await, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let fx = setup(&[("a.example", 30, false), ("b.example", 30, false)]).await;
        let t = &fx.tracker;

        t.record_failure("1.2.3.4", "a.example", "invalid_solution").await;
        t.record_failure("1.2.3.4", "a.example", "invalid_solution").await;
        t.record_failure("1.2.3.4", "b.example", "invalid_solution").await;

        assert_eq!(t.strike_count_for("1.2.3.4", "a.example").await, 2);
        assert_eq!(t.strike_count_for("1.2.3.4", "b.example").await, 1);
        assert_eq!(t.active_strikes().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_domain_falls_back_to_default_policy() {
        let fx = setup(&[]).await;
        // Default has no excusal: the timeout counts.
        assert_eq!(
            fx.tracker.record_failure("1.2.3.4", "unknown.example", "timeout").await,
            (1, false)
        );
    }

    #[tokio::test]
    async fn test_failed_kernel_add_does_not_declare_blocked() {
        let fx = setup(&[("example.com", 30, false)]).await;
        let t = &fx.tracker;

        // Fill the only shard so the kernel add fails.
        fx.fw
            .report_extra_members("strikegate-temporary-0", TEMPORARY_SET_CAPACITY as usize);
        fx.fw.fail_creates(true);

        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        let (count, blocked) = t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        assert_eq!((count, blocked), (3, false));
        assert!(fx.store.block_for("1.2.3.4").await.unwrap().is_none());
        assert_eq!(fx.metrics.blocks_total(), 0);

        // The elevated count retries the block on the next failure.
        fx.fw.report_extra_members("strikegate-temporary-0", 0);
        let (count, blocked) = t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        assert_eq!((count, blocked), (4, true));
        assert!(fx.store.block_for("1.2.3.4").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_strikes_and_blocks() {
        let fx = setup(&[("example.com", 1, false)]).await;
        let t = &fx.tracker;

        for _ in 0..3 {
            t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        }
        assert!(fx.fw.contains("strikegate-temporary-0", "1.2.3.4"));

        let later = Utc::now() + Duration::seconds(61);
        t.sweep_at(later).await;

        assert!(!fx.fw.contains("strikegate-temporary-0", "1.2.3.4"));
        assert!(fx.store.block_for("1.2.3.4").await.unwrap().is_none());
        assert_eq!(t.strike_count_for("1.2.3.4", "example.com").await, 0);
        assert_eq!(t.active_strikes().await, 0);

        // Idempotent: a second sweep observes nothing left to do.
        t.sweep_at(later).await;
        assert_eq!(t.active_strikes().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_leaves_unexpired_state_alone() {
        let fx = setup(&[("example.com", 30, false)]).await;
        let t = &fx.tracker;

        t.record_failure("1.2.3.4", "example.com", "invalid_solution").await;
        t.sweep_at(Utc::now()).await;
        assert_eq!(t.strike_count_for("1.2.3.4", "example.com").await, 1);
    }

    #[tokio::test]
    async fn test_sweep_never_reaps_permanent_blocks() {
        let fx = setup(&[("locked.example", 0, false)]).await;
        let t = &fx.tracker;

        for _ in 0..3 {
            t.record_failure("5.6.7.8", "locked.example", "invalid_solution").await;
        }

        t.sweep_at(Utc::now() + Duration::days(365)).await;
        assert!(fx.fw.contains(PERMANENT_SET, "5.6.7.8"));
        assert!(fx.store.block_for("5.6.7.8").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_startup_replay_skips_expired_rows() {
        let fx = setup(&[("example.com", 30, false)]).await;
        let now = Utc::now();

        fx.store
            .upsert_strike(&Strike {
                ip: "1.1.1.1".to_string(),
                domain: "example.com".to_string(),
                strike_count: 2,
                first_failure: now,
                last_failure: now,
                first_timeout_excused: false,
                expires_at: Some(now + Duration::minutes(30)),
            })
            .await
            .unwrap();
        fx.store
            .upsert_strike(&Strike {
                ip: "2.2.2.2".to_string(),
                domain: "example.com".to_string(),
                strike_count: 2,
                first_failure: now,
                last_failure: now,
                first_timeout_excused: false,
                expires_at: Some(now - Duration::minutes(5)),
            })
            .await
            .unwrap();

        let blocklist = Arc::new(BlocklistManager::new(fx.fw.clone()));
        let replayed = Tracker::new(
            fx.store.clone(),
            Arc::new(Config::default()),
            blocklist,
            Arc::new(Metrics::new()),
        )
        .await;

        assert_eq!(replayed.active_strikes().await, 1);
        assert_eq!(replayed.strike_count_for("1.1.1.1", "example.com").await, 2);
        assert_eq!(replayed.strike_count_for("2.2.2.2", "example.com").await, 0);
    }

    #[tokio::test]
    async fn test_counts_accumulate_per_noexcused_failure() {
        let fx = setup(&[("example.com", 30, false)]).await;
        for k in 1..=2u32 {
            let (count, _) = fx
                .tracker
                .record_failure("9.9.9.9", "example.com", "hmac_failed")
                .await;
            assert_eq!(count, k);
        }
    }
}
