//! Live feed behavior across the full stack: reconnect coverage of the
//! tracked set, router-driven tracking, and the REST/stale fallback chain.

use std::sync::Arc;
use std::time::Duration;

use marketmux_core::{
    cache_key, Aggregator, AlphaVantageAdapter, AssetType, BinanceRestAdapter, CacheStore,
    FeedConfig, FeedState, FinnhubAdapter, HttpResponse, LiveFeedManager, ProviderId, Quote,
    ScriptedHttpClient, ScriptedTransport, Symbol, ThrottlePolicy, ThrottlingQueue, Warehouse,
    WarehouseConfig,
};
use tokio::time::sleep;

struct Stack {
    _dir: tempfile::TempDir,
    cache: CacheStore,
    feed: LiveFeedManager,
    aggregator: Arc<Aggregator>,
}

fn stack(client: &ScriptedHttpClient, transport: &ScriptedTransport) -> Stack {
    let dir = tempfile::tempdir().expect("tempdir");
    let warehouse = Warehouse::open(WarehouseConfig {
        db_path: dir.path().join("feed.duckdb"),
        max_pool_size: 2,
    })
    .expect("open warehouse");
    let cache = CacheStore::new(warehouse);
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
        Arc::new(transport.clone()),
        crypto.clone(),
        cache.clone(),
        FeedConfig::default(),
    );

    Stack {
        _dir: dir,
        cache,
        feed: feed.clone(),
        aggregator: Arc::new(Aggregator::new(primary, secondary, crypto, feed)),
    }
}

fn symbol(value: &str) -> Symbol {
    Symbol::parse(value).expect("valid symbol")
}

fn stale_quote(sym: &Symbol, price: f64) -> Quote {
    Quote::new(
        sym.clone(),
        AssetType::Crypto,
        price,
        0.0,
        0.0,
        1_709_251_200_000,
        ProviderId::Binance,
    )
    .expect("valid quote")
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_connection_and_full_subscription_set() {
    let client = ScriptedHttpClient::new();
    let transport = ScriptedTransport::new();
    transport.push_connection(vec![], false); // drops straight away
    transport.push_connection(vec![], true);
    let stack = stack(&client, &transport);

    stack.feed.track_symbol(&symbol("BTCUSDT"));
    stack.feed.track_symbol(&symbol("ETHUSDT"));
    stack.feed.track_symbol(&symbol("ETHUSDT")); // idempotent re-track

    // The fixed 5s backoff window must be enough to come back up.
    sleep(Duration::from_secs(6)).await;

    assert_eq!(stack.feed.state(), FeedState::Connected);
    assert_eq!(transport.connect_count(), 2);

    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 2, "exactly one batch subscribe per connection");
    for frame in &frames {
        assert!(frame.contains("btcusdt@ticker"), "got {frame}");
        assert!(frame.contains("ethusdt@ticker"), "got {frame}");
    }
    assert_eq!(stack.feed.tracked_symbols().len(), 2, "no duplicates after re-track");
}

#[tokio::test(start_paused = true)]
async fn router_crypto_quote_tracks_the_symbol_and_uses_rest_when_cold() {
    let client = ScriptedHttpClient::new();
    client.route(
        "/api/v3/ticker/24hr",
        HttpResponse::ok_json(
            r#"{"symbol": "BTCUSDT", "lastPrice": "64250.10", "priceChange": "10.0", "priceChangePercent": "0.02", "closeTime": 1709251200123}"#,
        ),
    );
    let transport = ScriptedTransport::new();
    transport.push_connection(vec![], true);
    let stack = stack(&client, &transport);

    let quote = stack
        .aggregator
        .quote(&symbol("BTCUSDT"), AssetType::Crypto)
        .await
        .expect("REST-backed quote");

    assert_eq!(quote.source, ProviderId::Binance);
    assert_eq!(quote.price, 64_250.10);
    assert!(!quote.is_stale);
    assert_eq!(
        stack
            .feed
            .tracked_symbols()
            .iter()
            .map(Symbol::as_str)
            .collect::<Vec<_>>(),
        vec!["BTCUSDT"]
    );
}

#[tokio::test(start_paused = true)]
async fn hot_cache_beats_rest_once_a_message_arrives() {
    let client = ScriptedHttpClient::new();
    let transport = ScriptedTransport::new();
    transport.push_connection(
        vec![String::from(
            r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","E":1709251201000,"s":"BTCUSDT","c":"64999.5","p":"10.0","P":"0.02"}}"#,
        )],
        true,
    );
    let stack = stack(&client, &transport);

    stack.feed.track_symbol(&symbol("BTCUSDT"));
    sleep(Duration::from_millis(100)).await;

    let quote = stack
        .aggregator
        .quote(&symbol("BTCUSDT"), AssetType::Crypto)
        .await
        .expect("hot quote");

    assert_eq!(quote.price, 64_999.5);
    assert_eq!(client.call_count(), 0, "hot cache answers without REST");
}

#[tokio::test(start_paused = true)]
async fn rest_failure_serves_persisted_stale_quote_marked_stale() {
    let client = ScriptedHttpClient::new();
    client.route("/api/v3/ticker/24hr", HttpResponse::with_status(500, "venue down"));
    let transport = ScriptedTransport::new();
    let stack = stack(&client, &transport);
    let btc = symbol("BTCUSDT");

    // A previously persisted quote that has outlived its TTL.
    let key = cache_key("quote", ProviderId::Binance.cache_tag(), btc.as_str(), None);
    stack.cache.write(&key, &stale_quote(&btc, 63_000.0), -10, "binance");

    let quote = stack.feed.quote(&btc).await.expect("stale quote served");
    assert!(quote.is_stale);
    assert_eq!(quote.price, 63_000.0);
}

#[tokio::test(start_paused = true)]
async fn total_absence_of_data_is_a_hard_failure() {
    let client = ScriptedHttpClient::new();
    client.route("/api/v3/ticker/24hr", HttpResponse::with_status(500, "venue down"));
    let transport = ScriptedTransport::new();
    let stack = stack(&client, &transport);

    let failure = stack
        .aggregator
        .quote(&symbol("SOLUSDT"), AssetType::Crypto)
        .await
        .expect_err("nothing cached, stream cold, REST down");
    assert_eq!(failure.attempts.len(), 1);
    assert_eq!(failure.attempts[0].0, ProviderId::Binance);
}
