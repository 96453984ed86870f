//! History archive and job coordination behavior: idempotent upserts, the
//! sparse-read live fallback, and single-grant mutual exclusion.

use std::sync::Arc;
use std::time::Duration;

use marketmux_core::{
    Aggregator, AlphaVantageAdapter, AssetType, BinanceRestAdapter, CacheStore, FeedConfig,
    FinnhubAdapter, HistoryRow, HistoryStore, HttpResponse, JobCoordinator, JobStatus,
    LiveFeedManager, ScriptedHttpClient, ScriptedTransport, Symbol, ThrottlePolicy,
    ThrottlingQueue, UtcDateTime, Warehouse, WarehouseConfig,
};

struct Stack {
    _dir: tempfile::TempDir,
    warehouse: Warehouse,
    history: HistoryStore,
    jobs: JobCoordinator,
}

fn stack(client: &ScriptedHttpClient) -> Stack {
    let dir = tempfile::tempdir().expect("tempdir");
    let warehouse = Warehouse::open(WarehouseConfig {
        db_path: dir.path().join("history.duckdb"),
        max_pool_size: 2,
    })
    .expect("open warehouse");
    let cache = CacheStore::new(warehouse.clone());
    let http = Arc::new(client.clone());

    let primary = Arc::new(AlphaVantageAdapter::new(
        http.clone(),
        cache.clone(),
        "https://av.test",
        "demo",
    ));
    let secondary = Arc::new(FinnhubAdapter::new(
        http.clone(),
        cache.clone(),
        "https://finnhub.test/api/v1",
        "token",
        ThrottlingQueue::from_policy(&ThrottlePolicy::finnhub_default()),
    ));
    let crypto = Arc::new(BinanceRestAdapter::new(
        http,
        cache.clone(),
        "https://binance.test",
    ));
    let feed = LiveFeedManager::new(
        Arc::new(ScriptedTransport::new()),
        crypto.clone(),
        cache,
        FeedConfig::default(),
    );
    let aggregator = Arc::new(Aggregator::new(primary, secondary, crypto, feed));

    Stack {
        _dir: dir,
        warehouse: warehouse.clone(),
        history: HistoryStore::new(warehouse.clone(), aggregator),
        jobs: JobCoordinator::new(warehouse),
    }
}

fn symbol(value: &str) -> Symbol {
    Symbol::parse(value).expect("valid symbol")
}

fn klines_body(bars: &[(i64, f64)]) -> String {
    let rows: Vec<String> = bars
        .iter()
        .map(|(time_ms, close)| {
            format!(r#"[{time_ms}, "1.0", "{close}", "0.5", "{close}", "100.0", 0]"#)
        })
        .collect();
    format!("[{}]", rows.join(","))
}

fn stored_row(symbol: &str, days_back: i64, close: f64) -> HistoryRow {
    HistoryRow {
        symbol: symbol.to_owned(),
        date: UtcDateTime::now().minus_days(days_back).date_string(),
        asset_type: "STOCK".to_owned(),
        open: close,
        high: close,
        low: close,
        close,
        volume: Some(100.0),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn backfill_is_idempotent_per_symbol_and_date() {
    let client = ScriptedHttpClient::new();
    let day_ms = 86_400_000_i64;
    client.route(
        "/api/v3/klines",
        HttpResponse::ok_json(klines_body(&[
            (day_ms, 100.0),
            (2 * day_ms, 101.0),
            (3 * day_ms, 102.0),
        ])),
    );
    let stack = stack(&client);
    let btc = symbol("BTCUSDT");

    let first = stack
        .history
        .backfill_symbol(&btc, AssetType::Crypto)
        .await
        .expect("first backfill");
    assert_eq!(first, 3);

    // Re-running must update rows in place, never duplicate them.
    let second = stack
        .history
        .backfill_symbol(&btc, AssetType::Crypto)
        .await
        .expect("second backfill");
    assert!(second >= 1);
    assert_eq!(stack.history.candle_count(&btc), 3);
    assert_eq!(stack.history.cached_symbols(), vec![String::from("BTCUSDT")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn sparse_history_returns_live_series_without_blocking() {
    let client = ScriptedHttpClient::new();
    // Live fetch succeeds; the opportunistic backfill's fetch fails later.
    client.route(
        "TIME_SERIES_DAILY",
        HttpResponse::ok_json(
            r#"{"Time Series (Daily)": {
                "2024-03-01": {"1. open": "1", "2. high": "2", "3. low": "0.5", "4. close": "1.5", "5. volume": "100"},
                "2024-02-29": {"1. open": "0.9", "2. high": "1.1", "3. low": "0.8", "4. close": "1.0", "5. volume": "90"}
            }}"#,
        ),
    );
    client.route("TIME_SERIES_DAILY", HttpResponse::with_status(500, "backfill window down"));
    client.route("/stock/candle", HttpResponse::with_status(500, "secondary down"));
    let stack = stack(&client);
    let aapl = symbol("AAPL");

    // Only 5 stored rows: far below the 20-row hit threshold.
    let rows: Vec<HistoryRow> = (0..5).map(|i| stored_row("AAPL", i, 100.0 + i as f64)).collect();
    stack.warehouse.upsert_history_rows(&rows).expect("seed rows");

    let series = stack
        .history
        .candles(&aapl, AssetType::Stock, 400)
        .await
        .expect("live series returned immediately");

    assert_eq!(series.source, "alphavantage");
    assert_eq!(series.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn dense_history_serves_stored_rows_without_network() {
    let client = ScriptedHttpClient::new();
    let stack = stack(&client);
    let aapl = symbol("AAPL");

    let rows: Vec<HistoryRow> = (0..25).map(|i| stored_row("AAPL", i, 100.0 + i as f64)).collect();
    stack.warehouse.upsert_history_rows(&rows).expect("seed rows");

    let series = stack
        .history
        .candles(&aapl, AssetType::Stock, 400)
        .await
        .expect("stored series");

    assert_eq!(series.source, "history");
    assert_eq!(series.len(), 25);
    assert!(series.time.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(client.call_count(), 0, "a dense archive answers without any upstream call");
}

#[tokio::test(flavor = "multi_thread")]
async fn total_failure_yields_absent_instead_of_error() {
    let client = ScriptedHttpClient::new();
    client.route("TIME_SERIES_DAILY", HttpResponse::with_status(500, "down"));
    client.route("/stock/candle", HttpResponse::with_status(500, "down too"));
    let stack = stack(&client);

    let result = stack
        .history
        .candles(&symbol("AAPL"), AssetType::Stock, 400)
        .await;
    assert!(result.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn append_latest_candle_writes_exactly_the_newest_bar() {
    let client = ScriptedHttpClient::new();
    let day_ms = 86_400_000_i64;
    client.route(
        "/api/v3/klines",
        HttpResponse::ok_json(klines_body(&[
            (day_ms, 100.0),
            (2 * day_ms, 101.0),
            (3 * day_ms, 102.0),
        ])),
    );
    let stack = stack(&client);
    let btc = symbol("BTCUSDT");

    let written = stack
        .history
        .append_latest_candle(&btc, AssetType::Crypto)
        .await
        .expect("append");

    assert_eq!(written, 1);
    assert_eq!(stack.history.candle_count(&btc), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_try_start_grants_exactly_one_caller() {
    let client = ScriptedHttpClient::new();
    let stack = stack(&client);
    let jobs = stack.jobs.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let jobs = jobs.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            jobs.try_start("screener:sp500").is_ok()
        }));
    }

    let mut grants = 0;
    for handle in handles {
        if handle.await.expect("task joins") {
            grants += 1;
        }
    }
    assert_eq!(grants, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn job_outcome_is_observable_through_persisted_status() {
    let client = ScriptedHttpClient::new();
    let stack = stack(&client);

    stack
        .jobs
        .spawn("daily", async { Ok::<(), String>(()) })
        .expect("accepted");

    let mut last_status = None;
    for _ in 0..100 {
        if let Some(row) = stack.jobs.status("daily").expect("status read") {
            last_status = Some(row.status);
            if row.status == JobStatus::Done {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last_status, Some(JobStatus::Done));
}
