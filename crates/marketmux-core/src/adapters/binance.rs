use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::cache::{cache_key, ttl, CacheStore};
use crate::circuit_breaker::CircuitBreaker;
use crate::http::{HttpClient, HttpRequest};
use crate::provider::{
    CandleWindow, CandlesRequest, CapabilitySet, MarketDataSource, MetricsRequest, NewsRequest,
    OverviewRequest, ProviderError, QuoteRequest,
};
use crate::{AssetType, CandleSeries, Metrics, NewsItem, Overview, ProviderId, Quote};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Binance REST adapter: the crypto polling path.
///
/// The streaming path owns the hot cache; this adapter backs the REST
/// fallback and the history store's crypto backfill. Quote TTL is short
/// (60s) because the stream normally keeps the persisted cache fresher than
/// any REST poll would.
#[derive(Clone)]
pub struct BinanceRestAdapter {
    http_client: Arc<dyn HttpClient>,
    cache: CacheStore,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl BinanceRestAdapter {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        cache: CacheStore,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            cache,
            base_url: base_url.into(),
            circuit_breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    pub fn with_default_base_url(http_client: Arc<dyn HttpClient>, cache: CacheStore) -> Self {
        Self::new(http_client, cache, DEFAULT_BASE_URL)
    }

    async fn fetch_json(&self, path_and_query: String) -> Result<String, ProviderError> {
        if !self.circuit_breaker.allow_request() {
            return Err(ProviderError::unavailable(
                "binance circuit breaker is open",
            ));
        }

        let url = format!("{}{path_and_query}", self.base_url);
        let response = self
            .http_client
            .execute(HttpRequest::get(url))
            .await
            .map_err(|error| {
                self.circuit_breaker.record_failure();
                ProviderError::unavailable(format!(
                    "binance transport error: {}",
                    error.message()
                ))
            })?;

        if response.status == 429 || response.status == 418 {
            return Err(ProviderError::rate_limited(format!(
                "binance returned status {}",
                response.status
            )));
        }

        // Binance reports bad symbols as 400 with a machine-readable code.
        if response.status >= 400 && response.status < 500 {
            if let Ok(api_error) = serde_json::from_str::<BinanceApiError>(&response.body) {
                return Err(ProviderError::no_data(format!(
                    "binance error {}: {}",
                    api_error.code, api_error.msg
                )));
            }
        }

        if !response.is_success() {
            self.circuit_breaker.record_failure();
            return Err(ProviderError::unavailable(format!(
                "binance returned status {}",
                response.status
            )));
        }

        self.circuit_breaker.record_success();
        Ok(response.body)
    }

    async fn fetch_quote(&self, req: &QuoteRequest) -> Result<Quote, ProviderError> {
        let key = cache_key(
            "quote",
            ProviderId::Binance.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Quote>(&key).fresh() {
            return Ok(cached);
        }

        let body = self
            .fetch_json(format!(
                "/api/v3/ticker/24hr?symbol={}",
                urlencoding::encode(req.symbol.as_str())
            ))
            .await?;

        let parsed: BinanceTicker = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse binance ticker: {error}"))
        })?;

        let quote = Quote::new(
            req.symbol.clone(),
            AssetType::Crypto,
            parse_decimal("lastPrice", &parsed.last_price)?,
            parse_decimal("priceChange", &parsed.price_change)?,
            parse_decimal("priceChangePercent", &parsed.price_change_percent)?,
            parsed.close_time,
            ProviderId::Binance,
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        self.cache
            .write(&key, &quote, ttl::CRYPTO_QUOTE, ProviderId::Binance.as_str());
        Ok(quote)
    }

    async fn fetch_candles(&self, req: &CandlesRequest) -> Result<CandleSeries, ProviderError> {
        let key = cache_key(
            "candle",
            ProviderId::Binance.cache_tag(),
            req.symbol.as_str(),
            Some(&req.window_variant()),
        );
        if let Some(cached) = self.cache.lookup::<CandleSeries>(&key).fresh() {
            return Ok(cached);
        }

        let query = match req.window {
            CandleWindow::Latest { limit } => format!(
                "/api/v3/klines?symbol={}&interval={}&limit={}",
                urlencoding::encode(req.symbol.as_str()),
                req.interval,
                limit.min(1_000),
            ),
            CandleWindow::Between { from, to } => format!(
                "/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}",
                urlencoding::encode(req.symbol.as_str()),
                req.interval,
                from * 1_000,
                to * 1_000,
            ),
        };
        let body = self.fetch_json(query).await?;

        let rows: Vec<Vec<Value>> = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse binance klines: {error}"))
        })?;

        if rows.is_empty() {
            return Err(ProviderError::no_data("binance kline response is empty"));
        }

        let mut time = Vec::with_capacity(rows.len());
        let mut open = Vec::with_capacity(rows.len());
        let mut high = Vec::with_capacity(rows.len());
        let mut low = Vec::with_capacity(rows.len());
        let mut close = Vec::with_capacity(rows.len());
        let mut volume = Vec::with_capacity(rows.len());

        for row in &rows {
            // Kline rows are positional: open time, then OHLCV as strings.
            if row.len() < 6 {
                return Err(ProviderError::no_data("binance kline row is truncated"));
            }
            time.push(row[0].as_i64().ok_or_else(|| {
                ProviderError::no_data("binance kline open time is not an integer")
            })?);
            open.push(parse_kline_field(&row[1], "open")?);
            high.push(parse_kline_field(&row[2], "high")?);
            low.push(parse_kline_field(&row[3], "low")?);
            close.push(parse_kline_field(&row[4], "close")?);
            volume.push(parse_kline_field(&row[5], "volume")?);
        }

        let series = CandleSeries::new(
            time,
            open,
            high,
            low,
            close,
            volume,
            ProviderId::Binance.as_str(),
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        self.cache
            .write(&key, &series, ttl::CRYPTO_CANDLE, ProviderId::Binance.as_str());
        Ok(series)
    }
}

impl MarketDataSource for BinanceRestAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Binance
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(true, true, false, false, false)
    }

    fn quote<'a>(
        &'a self,
        req: QuoteRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Quote, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_quote(&req).await })
    }

    fn candles<'a>(
        &'a self,
        req: CandlesRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CandleSeries, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_candles(&req).await })
    }

    fn overview<'a>(
        &'a self,
        _req: OverviewRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Overview, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ProviderError::invalid_request(
                "binance has no fundamentals endpoint",
            ))
        })
    }

    fn news<'a>(
        &'a self,
        _req: NewsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NewsItem>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ProviderError::invalid_request("binance has no news endpoint"))
        })
    }

    fn metrics<'a>(
        &'a self,
        _req: MetricsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Metrics, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ProviderError::invalid_request(
                "binance has no metrics endpoint",
            ))
        })
    }
}

/// Response from `/api/v3/ticker/24hr`: decimal fields arrive as strings.
#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "priceChange")]
    price_change: String,
    #[serde(rename = "priceChangePercent")]
    price_change_percent: String,
    /// Ticker window close, epoch milliseconds.
    #[serde(rename = "closeTime")]
    close_time: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceApiError {
    code: i64,
    msg: String,
}

fn parse_decimal(field: &str, value: &str) -> Result<f64, ProviderError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ProviderError::no_data(format!("binance '{field}' is not numeric: '{value}'")))
}

fn parse_kline_field(value: &Value, field: &str) -> Result<f64, ProviderError> {
    value
        .as_str()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .or_else(|| value.as_f64())
        .ok_or_else(|| ProviderError::no_data(format!("binance kline '{field}' is not numeric")))
}

#[cfg(test)]
mod tests {
    use marketmux_warehouse::{Warehouse, WarehouseConfig};

    use super::*;
    use crate::http::{HttpResponse, ScriptedHttpClient};
    use crate::provider::ProviderErrorKind;
    use crate::{Interval, Symbol};

    fn adapter_with(client: &ScriptedHttpClient) -> (tempfile::TempDir, BinanceRestAdapter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: dir.path().join("binance.duckdb"),
            max_pool_size: 2,
        })
        .expect("open warehouse");
        let adapter = BinanceRestAdapter::new(
            Arc::new(client.clone()),
            CacheStore::new(warehouse),
            "https://binance.test",
        );
        (dir, adapter)
    }

    #[tokio::test]
    async fn ticker_normalizes_string_decimals() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/api/v3/ticker/24hr",
            HttpResponse::ok_json(
                r#"{"symbol": "BTCUSDT", "lastPrice": "64250.10", "priceChange": "-94.99", "priceChangePercent": "-0.372", "closeTime": 1709251200123}"#,
            ),
        );
        let (_dir, adapter) = adapter_with(&client);

        let quote = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("BTCUSDT").expect("symbol")))
            .await
            .expect("quote");

        assert_eq!(quote.price, 64_250.10);
        assert_eq!(quote.change_abs, -94.99);
        assert_eq!(quote.change_pct, -0.372);
        assert_eq!(quote.timestamp, 1_709_251_200_123);
        assert_eq!(quote.asset_type, AssetType::Crypto);
    }

    #[tokio::test]
    async fn invalid_symbol_error_maps_to_no_data() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/api/v3/ticker/24hr",
            HttpResponse::with_status(400, r#"{"code": -1121, "msg": "Invalid symbol."}"#),
        );
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("NOPEUSDT").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::NoData);
    }

    #[tokio::test]
    async fn klines_request_carries_interval_and_limit() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/api/v3/klines",
            HttpResponse::ok_json(
                r#"[[1709164800000, "1.0", "2.0", "0.5", "1.5", "100.0", 1709168399999],
                    [1709168400000, "1.5", "2.5", "1.0", "2.0", "120.0", 1709171999999]]"#,
            ),
        );
        let (_dir, adapter) = adapter_with(&client);

        let request = CandlesRequest::latest(
            Symbol::parse("BTCUSDT").expect("symbol"),
            Interval::OneHour,
            168,
        )
        .expect("request");
        let series = adapter.fetch_candles(&request).await.expect("series");

        assert_eq!(series.len(), 2);
        assert_eq!(series.close, vec![1.5, 2.0]);
        let url = &client.calls()[0];
        assert!(url.contains("interval=1h"));
        assert!(url.contains("limit=168"));
    }

    #[tokio::test]
    async fn candle_cache_hit_makes_no_network_call() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/api/v3/klines",
            HttpResponse::ok_json(r#"[[1709164800000, "1.0", "2.0", "0.5", "1.5", "100.0", 0]]"#),
        );
        let (_dir, adapter) = adapter_with(&client);
        let request = CandlesRequest::latest(
            Symbol::parse("ETHUSDT").expect("symbol"),
            Interval::OneDay,
            30,
        )
        .expect("request");

        adapter.fetch_candles(&request).await.expect("first fetch");
        adapter.fetch_candles(&request).await.expect("cached fetch");
        assert_eq!(client.call_count(), 1);
    }
}
