//! Durable daily OHLCV archive with backfill, append, and cache-miss
//! recovery.
//!
//! Backfill and append both upsert on (symbol, date), so re-running either
//! is safe even when concurrent writers race; last writer wins per row.
//! Reads that find too few rows are treated as a cache miss: the caller
//! gets a live series from the router immediately while a backfill is
//! scheduled fire-and-forget to populate the archive for next time.

use std::sync::Arc;

use marketmux_warehouse::{HistoryRow, Warehouse, WarehouseError};
use thiserror::Error;
use time::macros::format_description;
use time::Date;
use tracing::{debug, info, warn};

use crate::router::{AggregateError, Aggregator};
use crate::{AssetType, CandleSeries, Symbol, UtcDateTime};

/// Window fetched by a full backfill, in calendar days (two years).
const BACKFILL_DAYS: usize = 730;
/// Window fetched by the nightly append, in calendar days.
const APPEND_DAYS: usize = 5;
/// Minimum stored rows for a read to count as a hit.
const MIN_ROWS_FOR_HIT: usize = 20;

/// Source tag carried by series built from archive rows.
const HISTORY_SOURCE: &str = "history";

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Fetch(#[from] AggregateError),
    #[error(transparent)]
    Storage(#[from] WarehouseError),
}

/// The daily price archive.
#[derive(Clone)]
pub struct HistoryStore {
    warehouse: Warehouse,
    router: Arc<Aggregator>,
}

impl HistoryStore {
    pub fn new(warehouse: Warehouse, router: Arc<Aggregator>) -> Self {
        Self { warehouse, router }
    }

    /// Bulk-populate two years of daily bars for a symbol.
    ///
    /// Safe to re-run: rows upsert on (symbol, date). Rows that individually
    /// fail to persist are skipped; the count of rows written is returned.
    pub async fn backfill_symbol(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
    ) -> Result<usize, HistoryError> {
        let series = self
            .router
            .daily_series(symbol, asset_type, BACKFILL_DAYS)
            .await?;
        let rows = rows_from_series(symbol, asset_type, &series);
        let written = self.warehouse.upsert_history_rows(&rows)?;
        info!(symbol = %symbol, written, fetched = rows.len(), "backfill complete");
        Ok(written)
    }

    /// Upsert only the most recent daily bar: the nightly incremental path.
    pub async fn append_latest_candle(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
    ) -> Result<usize, HistoryError> {
        let series = self
            .router
            .daily_series(symbol, asset_type, APPEND_DAYS)
            .await?;
        let rows = rows_from_series(symbol, asset_type, &series);
        let Some(latest) = rows.last() else {
            return Ok(0);
        };
        let written = self
            .warehouse
            .upsert_history_rows(std::slice::from_ref(latest))?;
        Ok(written)
    }

    /// Read the trailing `days` of stored bars, ascending.
    ///
    /// Fewer than 20 stored rows counts as a miss: the router's live series
    /// is returned immediately and a backfill is scheduled without blocking
    /// the caller. Returns `None` only when the live fallback also fails;
    /// this accessor never surfaces an error.
    pub async fn candles(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
        days: i64,
    ) -> Option<CandleSeries> {
        let since = UtcDateTime::now().minus_days(days).date_string();
        let rows = match self.warehouse.history_rows(symbol.as_str(), &since) {
            Ok(rows) => rows,
            Err(error) => {
                warn!(symbol = %symbol, %error, "history read failed, falling back to live");
                Vec::new()
            }
        };

        if rows.len() >= MIN_ROWS_FOR_HIT {
            if let Some(series) = series_from_rows(&rows) {
                return Some(series);
            }
        }

        let live = match self
            .router
            .candles(symbol, asset_type, range_token_for_days(days))
            .await
        {
            Ok(series) => series,
            Err(error) => {
                warn!(symbol = %symbol, %error, "live fallback failed for history read");
                return None;
            }
        };

        // Opportunistic repopulation; the caller never waits on it.
        let store = self.clone();
        let symbol = symbol.clone();
        tokio::spawn(async move {
            match store.backfill_symbol(&symbol, asset_type).await {
                Ok(written) => debug!(symbol = %symbol, written, "scheduled backfill finished"),
                Err(error) => warn!(symbol = %symbol, %error, "scheduled backfill failed"),
            }
        });

        Some(live)
    }

    /// Stored row count for a symbol, for operational checks.
    pub fn candle_count(&self, symbol: &Symbol) -> usize {
        match self.warehouse.history_count(symbol.as_str()) {
            Ok(count) => count,
            Err(error) => {
                warn!(symbol = %symbol, %error, "history count failed");
                0
            }
        }
    }

    /// Symbols present in the archive, for operational checks.
    pub fn cached_symbols(&self) -> Vec<String> {
        match self.warehouse.history_symbols() {
            Ok(symbols) => symbols,
            Err(error) => {
                warn!(%error, "history symbol listing failed");
                Vec::new()
            }
        }
    }
}

/// Map a requested day span to the nearest router range token for the live
/// proxy call.
fn range_token_for_days(days: i64) -> &'static str {
    if days >= 365 {
        "1y"
    } else if days >= 180 {
        "6m"
    } else if days >= 90 {
        "3m"
    } else if days >= 30 {
        "1m"
    } else {
        "1w"
    }
}

fn rows_from_series(
    symbol: &Symbol,
    asset_type: AssetType,
    series: &CandleSeries,
) -> Vec<HistoryRow> {
    let mut rows = Vec::with_capacity(series.len());
    for index in 0..series.len() {
        let date = match UtcDateTime::from_unix_millis(series.time[index]) {
            Ok(ts) => ts.date_string(),
            Err(error) => {
                warn!(symbol = %symbol, %error, "skipping bar with invalid timestamp");
                continue;
            }
        };
        rows.push(HistoryRow {
            symbol: symbol.as_str().to_owned(),
            date,
            asset_type: asset_type.as_str().to_owned(),
            open: series.open[index],
            high: series.high[index],
            low: series.low[index],
            close: series.close[index],
            volume: Some(series.volume[index]),
        });
    }
    rows
}

fn series_from_rows(rows: &[HistoryRow]) -> Option<CandleSeries> {
    let mut time = Vec::with_capacity(rows.len());
    let mut open = Vec::with_capacity(rows.len());
    let mut high = Vec::with_capacity(rows.len());
    let mut low = Vec::with_capacity(rows.len());
    let mut close = Vec::with_capacity(rows.len());
    let mut volume = Vec::with_capacity(rows.len());

    for row in rows {
        let date = match Date::parse(&row.date, format_description!("[year]-[month]-[day]")) {
            Ok(date) => date,
            Err(error) => {
                warn!(date = %row.date, %error, "skipping archive row with invalid date");
                continue;
            }
        };
        time.push(date.midnight().assume_utc().unix_timestamp() * 1_000);
        open.push(row.open);
        high.push(row.high);
        low.push(row.low);
        close.push(row.close);
        volume.push(row.volume.unwrap_or(0.0));
    }

    if time.is_empty() {
        return None;
    }

    CandleSeries::new(time, open, high, low, close, volume, HISTORY_SOURCE).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, close: f64) -> HistoryRow {
        HistoryRow {
            symbol: "AAPL".into(),
            date: date.into(),
            asset_type: "STOCK".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: Some(10.0),
        }
    }

    #[test]
    fn range_token_mapping_covers_every_span() {
        assert_eq!(range_token_for_days(400), "1y");
        assert_eq!(range_token_for_days(365), "1y");
        assert_eq!(range_token_for_days(200), "6m");
        assert_eq!(range_token_for_days(90), "3m");
        assert_eq!(range_token_for_days(45), "1m");
        assert_eq!(range_token_for_days(10), "1w");
    }

    #[test]
    fn series_from_rows_is_ascending_with_history_source() {
        let rows = vec![row("2024-02-28", 1.0), row("2024-02-29", 2.0), row("2024-03-01", 3.0)];
        let series = series_from_rows(&rows).expect("series builds");

        assert_eq!(series.len(), 3);
        assert!(series.time[0] < series.time[2]);
        assert_eq!(series.close, vec![1.0, 2.0, 3.0]);
        assert_eq!(series.source, "history");
    }

    #[test]
    fn series_from_rows_skips_malformed_dates() {
        let rows = vec![row("not-a-date", 1.0), row("2024-03-01", 2.0)];
        let series = series_from_rows(&rows).expect("series builds");
        assert_eq!(series.len(), 1);
        assert_eq!(series.close, vec![2.0]);
    }

    #[test]
    fn empty_rows_build_no_series() {
        assert!(series_from_rows(&[]).is_none());
    }
}
