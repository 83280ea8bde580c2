//! Durable strike and block records in an embedded SQLite database.
//!
//! The tracker funnels every write through its own lock, so a small pool
//! is plenty. Timestamps are UTC throughout; a NULL expiry means "never
//! expires".

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use crate::tracker::Strike;

/// A row in `blocked_ips`.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub ip: String,
    pub domain: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` means the block is permanent.
    pub lockout_expires: Option<DateTime<Utc>>,
    pub reason: String,
    /// Kernel set currently holding the IP.
    pub logical_set_name: String,
}

/// An expired block due for removal from its kernel set.
#[derive(Debug, Clone)]
pub struct ExpiredBlock {
    pub ip: String,
    pub logical_set_name: String,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS strikes (
        ip TEXT NOT NULL,
        domain TEXT NOT NULL,
        strike_count INTEGER NOT NULL,
        first_failure TIMESTAMP NOT NULL,
        last_failure TIMESTAMP NOT NULL,
        first_timeout_excused BOOLEAN DEFAULT 0,
        expires_at TIMESTAMP,
        PRIMARY KEY (ip, domain)
    )",
    "CREATE INDEX IF NOT EXISTS idx_strikes_expires ON strikes(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_strikes_domain ON strikes(domain)",
    "CREATE TABLE IF NOT EXISTS blocked_ips (
        ip TEXT PRIMARY KEY,
        domain TEXT NOT NULL,
        blocked_at TIMESTAMP NOT NULL,
        lockout_expires TIMESTAMP,
        reason TEXT,
        logical_set_name TEXT
    )",
];

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(opts)
            .await
            .with_context(|| format!("failed to open database {}", path.display()))?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection keeps every
    /// query on the same database.
    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .context("failed to open in-memory database")?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize schema")?;
        }
        Ok(())
    }

    pub async fn upsert_strike(&self, strike: &Strike) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO strikes
             (ip, domain, strike_count, first_failure, last_failure, first_timeout_excused, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&strike.ip)
        .bind(&strike.domain)
        .bind(strike.strike_count as i64)
        .bind(strike.first_failure)
        .bind(strike.last_failure)
        .bind(strike.first_timeout_excused)
        .bind(strike.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_strike(&self, ip: &str, domain: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM strikes WHERE ip = ?1 AND domain = ?2")
            .bind(ip)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Strikes that have not expired as of `now`, for startup replay.
    pub async fn load_unexpired_strikes(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Strike>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT ip, domain, strike_count, first_failure, last_failure,
                    first_timeout_excused, expires_at
             FROM strikes
             WHERE expires_at IS NULL OR expires_at > ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut strikes = Vec::with_capacity(rows.len());
        for row in rows {
            strikes.push(Strike {
                ip: row.try_get("ip")?,
                domain: row.try_get("domain")?,
                strike_count: row.try_get::<i64, _>("strike_count")? as u32,
                first_failure: row.try_get("first_failure")?,
                last_failure: row.try_get("last_failure")?,
                first_timeout_excused: row.try_get("first_timeout_excused")?,
                expires_at: row.try_get("expires_at")?,
            });
        }
        Ok(strikes)
    }

    pub async fn insert_block(&self, block: &BlockRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO blocked_ips
             (ip, domain, blocked_at, lockout_expires, reason, logical_set_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&block.ip)
        .bind(&block.domain)
        .bind(block.blocked_at)
        .bind(block.lockout_expires)
        .bind(&block.reason)
        .bind(&block.logical_set_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_block(&self, ip: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM blocked_ips WHERE ip = ?1")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Blocks whose lockout has passed as of `now`, with the kernel set
    /// each one must be removed from.
    pub async fn expired_blocks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredBlock>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT ip, logical_set_name FROM blocked_ips
             WHERE lockout_expires IS NOT NULL AND lockout_expires < ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut blocks = Vec::with_capacity(rows.len());
        for row in rows {
            blocks.push(ExpiredBlock {
                ip: row.try_get("ip")?,
                logical_set_name: row.try_get("logical_set_name")?,
            });
        }
        Ok(blocks)
    }

    /// Fetch the block row for an IP, if any.
    pub async fn block_for(&self, ip: &str) -> Result<Option<BlockRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT ip, domain, blocked_at, lockout_expires, reason, logical_set_name
             FROM blocked_ips WHERE ip = ?1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(BlockRecord {
                ip: row.try_get("ip")?,
                domain: row.try_get("domain")?,
                blocked_at: row.try_get("blocked_at")?,
                lockout_expires: row.try_get("lockout_expires")?,
                reason: row.try_get("reason")?,
                logical_set_name: row.try_get("logical_set_name")?,
            })),
            None => Ok(None),
        }
    }
}
