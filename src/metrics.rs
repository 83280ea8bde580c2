//! Daemon counters and the plain-text scrape endpoint.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::info;

use crate::blocklist::BlocklistManager;
use crate::shutdown::ShutdownToken;
use crate::tracker::Tracker;

/// Cumulative daemon counters.
pub struct Metrics {
    started_at: Instant,
    blocks_total: AtomicU64,
    strike_updates_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            blocks_total: AtomicU64::new(0),
            strike_updates_total: AtomicU64::new(0),
        }
    }

    pub fn record_block(&self) {
        self.blocks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_strike_update(&self) {
        self.strike_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_total(&self) -> u64 {
        self.blocks_total.load(Ordering::Relaxed)
    }

    pub fn strike_updates_total(&self) -> u64 {
        self.strike_updates_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
struct AppState {
    tracker: Arc<Tracker>,
    blocklist: Arc<BlocklistManager>,
    metrics: Arc<Metrics>,
}

/// HTTP server exposing `/metrics` and `/health`.
pub struct MetricsServer {
    port: u16,
    state: AppState,
}

impl MetricsServer {
    pub fn new(
        port: u16,
        tracker: Arc<Tracker>,
        blocklist: Arc<BlocklistManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            port,
            state: AppState {
                tracker,
                blocklist,
                metrics,
            },
        }
    }

    pub async fn run(self, mut shutdown: ShutdownToken) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(render_metrics))
            .route("/health", get(render_health))
            .with_state(self.state);

        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind metrics port {}", self.port))?;
        info!(port = self.port, "metrics_server_listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("metrics server failed")?;
        Ok(())
    }
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.tracker.active_strikes().await as u64;
    let permanent = state.blocklist.permanent_size().await as u64;
    let temporary = state.blocklist.total_temporary_size().await as u64;
    let whitelist = state.blocklist.whitelist_size().await as u64;
    let search_engines = state.blocklist.search_engine_size().await as u64;

    let mut out = String::new();
    write_metric(
        &mut out,
        "strikegate_active_strikes",
        "gauge",
        "Number of (IP, domain) pairs with active strikes",
        active,
    );
    write_metric(
        &mut out,
        "strikegate_permanent_blocks",
        "gauge",
        "Number of permanently blocked IPs",
        permanent,
    );
    write_metric(
        &mut out,
        "strikegate_temporary_blocks",
        "gauge",
        "Number of temporarily blocked IPs across all shards",
        temporary,
    );
    write_metric(
        &mut out,
        "strikegate_total_blocks",
        "gauge",
        "Total number of blocked IPs",
        permanent + temporary,
    );
    write_metric(
        &mut out,
        "strikegate_whitelist_size",
        "gauge",
        "Number of whitelisted IPs",
        whitelist,
    );
    write_metric(
        &mut out,
        "strikegate_search_engine_ips",
        "gauge",
        "Number of search engine IPs",
        search_engines,
    );
    write_metric(
        &mut out,
        "strikegate_uptime_seconds",
        "counter",
        "Daemon uptime in seconds",
        state.metrics.uptime_seconds(),
    );
    write_metric(
        &mut out,
        "strikegate_blocks_total",
        "counter",
        "Total blocks issued since start",
        state.metrics.blocks_total(),
    );
    write_metric(
        &mut out,
        "strikegate_strike_updates_total",
        "counter",
        "Total strike updates processed",
        state.metrics.strike_updates_total(),
    );

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], out)
}

async fn render_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.metrics.uptime_seconds(),
    }))
}
