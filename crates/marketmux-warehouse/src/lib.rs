//! # Marketmux Warehouse
//!
//! DuckDB-based persistence for the marketmux engine.
//!
//! ## Overview
//!
//! This crate owns the three durable tables shared by the engine's
//! concurrent flows:
//!
//! | Table | Description |
//! |-------|-------------|
//! | `cache_entries` | Key-payload response cache with TTL expiry marks |
//! | `price_history` | Daily OHLCV archive, one row per (symbol, date) |
//! | `job_state` | Batch-job status records used for mutual exclusion |
//!
//! ## Semantics
//!
//! - Cache writes are last-writer-wins (`INSERT OR REPLACE`); entries past
//!   `expires_at` stay readable and are surfaced with their expiry so the
//!   caller can decide between refetch and stale-serving.
//! - Price history upserts are idempotent per (symbol, date); re-running a
//!   backfill updates rows instead of duplicating them, and rows that
//!   individually fail to persist are skipped rather than aborting the batch.
//! - [`Warehouse::job_try_start`] is the engine's one mutual-exclusion
//!   primitive: a transactional conditional update that grants at most one
//!   caller per job id, regardless of interleaving.
//!
//! ## Security
//!
//! All values reaching SQL are passed as parameters, never interpolated.

pub mod duckdb;
mod migrations;

use std::env;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ::duckdb::ToSql;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use duckdb::{DuckDbConnectionManager, PooledConnection};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A stored value did not round-trip to its expected representation.
    #[error("corrupt stored value: {0}")]
    CorruptValue(String),
}

/// Warehouse location and pool sizing.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub db_path: PathBuf,
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            db_path: resolve_marketmux_home().join("marketmux.duckdb"),
            max_pool_size: 4,
        }
    }
}

/// A cached payload row. `expires_at` is epoch seconds; staleness is derived
/// by the caller against its own clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRow {
    pub key: String,
    pub payload: String,
    pub expires_at: i64,
    pub source: String,
}

/// One daily OHLCV archive row, unique per (symbol, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub symbol: String,
    /// Calendar day, ISO `YYYY-MM-DD`.
    pub date: String,
    pub asset_type: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
}

/// Persisted batch-job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Idle,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "IDLE" => Ok(Self::Idle),
            "RUNNING" => Ok(Self::Running),
            "DONE" => Ok(Self::Done),
            "ERROR" => Ok(Self::Error),
            other => Err(WarehouseError::CorruptValue(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// One job-state record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRow {
    pub id: String,
    pub status: JobStatus,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// The main warehouse interface for engine persistence.
#[derive(Clone)]
pub struct Warehouse {
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let manager = DuckDbConnectionManager::new(config.db_path.clone(), config.max_pool_size);
        let warehouse = Self { manager };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Initialize database schema.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file.
    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Look up a cache entry by key. Expired entries are returned too; the
    /// caller derives staleness from `expires_at`.
    pub fn cache_get(&self, key: &str) -> Result<Option<CacheRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT key, payload, expires_at, source FROM cache_entries WHERE key = ?",
        )?;
        let mut rows = statement.query([key])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        Ok(Some(CacheRow {
            key: row.get(0)?,
            payload: row.get(1)?,
            expires_at: row.get(2)?,
            source: row.get(3)?,
        }))
    }

    /// Write a cache entry, replacing any prior value for the key.
    pub fn cache_put(
        &self,
        key: &str,
        payload: &str,
        expires_at: i64,
        source: &str,
    ) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let params: [&dyn ToSql; 4] = [&key, &payload, &expires_at, &source];
        connection.execute(
            "INSERT OR REPLACE INTO cache_entries (key, payload, expires_at, source, updated_at) \
             VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Upsert daily history rows keyed by (symbol, date).
    ///
    /// Rows that individually fail to persist are skipped; the count of rows
    /// actually written is returned.
    pub fn upsert_history_rows(&self, rows: &[HistoryRow]) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let connection = self.manager.acquire()?;
        let mut written = 0_usize;
        for row in rows {
            let params: [&dyn ToSql; 8] = [
                &row.symbol,
                &row.date,
                &row.asset_type,
                &row.open,
                &row.high,
                &row.low,
                &row.close,
                &row.volume,
            ];
            let result = connection.execute(
                "INSERT OR REPLACE INTO price_history \
                 (symbol, date, asset_type, open, high, low, close, volume, updated_at) \
                 VALUES (?, TRY_CAST(? AS DATE), ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                params.as_slice(),
            );
            match result {
                Ok(_) => written += 1,
                Err(error) => {
                    warn!(symbol = %row.symbol, date = %row.date, %error, "skipping history row");
                }
            }
        }

        Ok(written)
    }

    /// Read history rows for a symbol with date >= `since_date`, ascending.
    pub fn history_rows(
        &self,
        symbol: &str,
        since_date: &str,
    ) -> Result<Vec<HistoryRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection.prepare(
            "SELECT symbol, CAST(date AS VARCHAR), asset_type, open, high, low, close, volume \
             FROM price_history WHERE symbol = ? AND date >= TRY_CAST(? AS DATE) \
             ORDER BY date ASC",
        )?;
        let params: [&dyn ToSql; 2] = [&symbol, &since_date];
        let mut rows = statement.query(params.as_slice())?;

        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(HistoryRow {
                symbol: row.get(0)?,
                date: row.get(1)?,
                asset_type: row.get(2)?,
                open: row.get(3)?,
                high: row.get(4)?,
                low: row.get(5)?,
                close: row.get(6)?,
                volume: row.get(7)?,
            });
        }

        Ok(output)
    }

    /// Count stored history rows for a symbol.
    pub fn history_count(&self, symbol: &str) -> Result<usize, WarehouseError> {
        let connection = self.manager.acquire()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM price_history WHERE symbol = ?",
            [symbol],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    /// Distinct symbols present in the history archive.
    pub fn history_symbols(&self) -> Result<Vec<String>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement =
            connection.prepare("SELECT DISTINCT symbol FROM price_history ORDER BY symbol ASC")?;
        let mut rows = statement.query([])?;

        let mut output = Vec::new();
        while let Some(row) = rows.next()? {
            output.push(row.get(0)?);
        }

        Ok(output)
    }

    /// Atomically transition a job to RUNNING unless it is already RUNNING.
    ///
    /// The existence check and the transition run as one transactional
    /// conditional update, so two concurrent callers for the same id can
    /// never both be granted.
    pub fn job_try_start(&self, id: &str, started_at: i64) -> Result<bool, WarehouseError> {
        let connection = self.manager.acquire()?;
        connection.execute_batch("BEGIN TRANSACTION")?;

        let result = (|| -> Result<bool, WarehouseError> {
            let params: [&dyn ToSql; 1] = [&id];
            connection.execute(
                "INSERT OR IGNORE INTO job_state (id, status, started_at, finished_at) \
                 VALUES (?, 'IDLE', NULL, NULL)",
                params.as_slice(),
            )?;

            let params: [&dyn ToSql; 2] = [&started_at, &id];
            let granted = connection.execute(
                "UPDATE job_state SET status = 'RUNNING', started_at = ?, finished_at = NULL \
                 WHERE id = ? AND status <> 'RUNNING'",
                params.as_slice(),
            )?;

            Ok(granted == 1)
        })();

        finalize_transaction(&connection, result)
    }

    /// Record the terminal status of a finished job.
    pub fn job_finish(
        &self,
        id: &str,
        status: JobStatus,
        finished_at: i64,
    ) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire()?;
        let status = status.as_str();
        let params: [&dyn ToSql; 3] = [&status, &finished_at, &id];
        connection.execute(
            "UPDATE job_state SET status = ?, finished_at = ? WHERE id = ?",
            params.as_slice(),
        )?;
        Ok(())
    }

    /// Read the persisted state for a job id.
    pub fn job_get(&self, id: &str) -> Result<Option<JobRow>, WarehouseError> {
        let connection = self.manager.acquire()?;
        let mut statement = connection
            .prepare("SELECT id, status, started_at, finished_at FROM job_state WHERE id = ?")?;
        let mut rows = statement.query([id])?;

        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let status: String = row.get(1)?;
        Ok(Some(JobRow {
            id: row.get(0)?,
            status: status.parse()?,
            started_at: row.get(2)?,
            finished_at: row.get(3)?,
        }))
    }
}

fn finalize_transaction<T>(
    connection: &::duckdb::Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn resolve_marketmux_home() -> PathBuf {
    if let Ok(home) = env::var("MARKETMUX_HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home);
        }
    }

    if let Ok(home) = env::var("HOME") {
        if !home.trim().is_empty() {
            return PathBuf::from(home).join(".marketmux");
        }
    }

    PathBuf::from(".marketmux")
}
