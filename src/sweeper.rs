//! Periodic reaper driving the tracker's expiry logic.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::shutdown::ShutdownToken;
use crate::tracker::Tracker;

/// How often expired strikes and blocks are reaped.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the sweeper until shutdown.
pub async fn run(tracker: Arc<Tracker>, mut shutdown: ShutdownToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; consume it so the initial
    // sweep happens one full period after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tracker.sweep().await,
        }
    }
    debug!("sweeper_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlocklistManager;
    use crate::config::Config;
    use crate::firewall::memory::MemoryFirewall;
    use crate::metrics::Metrics;
    use crate::shutdown::Shutdown;
    use crate::store::Store;

    async fn tracker() -> Arc<Tracker> {
        let fw = Arc::new(MemoryFirewall::new());
        let blocklist = Arc::new(BlocklistManager::new(fw));
        blocklist.initialize().await.unwrap();

        let store = Store::open_in_memory().await.unwrap();
        Arc::new(
            Tracker::new(
                store,
                Arc::new(Config::default()),
                blocklist,
                Arc::new(Metrics::new()),
            )
            .await,
        )
    }

    #[test]
    fn test_sweep_interval() {
        assert_eq!(SWEEP_INTERVAL, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let tracker = tracker().await;
        let shutdown = Shutdown::new();
        let task = tokio::spawn(run(tracker, shutdown.token()));

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_stops_even_when_already_triggered() {
        let tracker = tracker().await;
        let shutdown = Shutdown::new();
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), run(tracker, shutdown.token()))
            .await
            .expect("sweeper did not observe prior shutdown");
    }
}
