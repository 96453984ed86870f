use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cache::{cache_key, ttl, CacheStore};
use crate::circuit_breaker::CircuitBreaker;
use crate::http::{HttpClient, HttpRequest};
use crate::provider::{
    CandleWindow, CandlesRequest, CapabilitySet, MarketDataSource, MetricsRequest, NewsRequest,
    OverviewRequest, ProviderError, QuoteRequest,
};
use crate::throttling::{ThrottlePolicy, ThrottlingQueue};
use crate::{
    AssetType, CandleSeries, Interval, Metrics, NewsItem, Overview, ProviderId, Quote, UtcDateTime,
};

const DEFAULT_BASE_URL: &str = "https://finnhub.io/api/v1";

/// Finnhub adapter: the secondary equities source, and the only source for
/// news and key metrics.
///
/// Every outbound call is gated by the process-wide throttling queue so the
/// enforced 55/min budget holds under bursty concurrent demand. Finnhub
/// reports unknown symbols as an all-zero quote; that sentinel is mapped to
/// a no-data error rather than cached as a price of zero.
#[derive(Clone)]
pub struct FinnhubAdapter {
    http_client: Arc<dyn HttpClient>,
    cache: CacheStore,
    base_url: String,
    api_key: String,
    circuit_breaker: Arc<CircuitBreaker>,
    throttling: ThrottlingQueue,
}

impl FinnhubAdapter {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        cache: CacheStore,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        throttling: ThrottlingQueue,
    ) -> Self {
        Self {
            http_client,
            cache,
            base_url: base_url.into(),
            api_key: api_key.into(),
            circuit_breaker: Arc::new(CircuitBreaker::default()),
            throttling,
        }
    }

    pub fn with_default_base_url(
        http_client: Arc<dyn HttpClient>,
        cache: CacheStore,
        api_key: impl Into<String>,
    ) -> Self {
        Self::new(
            http_client,
            cache,
            DEFAULT_BASE_URL,
            api_key,
            ThrottlingQueue::from_policy(&ThrottlePolicy::finnhub_default()),
        )
    }

    async fn fetch_json(&self, path_and_query: String) -> Result<String, ProviderError> {
        if !self.circuit_breaker.allow_request() {
            return Err(ProviderError::unavailable(
                "finnhub circuit breaker is open",
            ));
        }

        if let Err(delay) = self.throttling.acquire() {
            return Err(ProviderError::rate_limited(format!(
                "finnhub budget exhausted; retry in {:.2}s",
                delay.as_secs_f64()
            )));
        }

        let url = format!("{}{path_and_query}", self.base_url);
        let request = HttpRequest::get(url).with_header("X-Finnhub-Token", &self.api_key);

        let response = self.http_client.execute(request).await.map_err(|error| {
            self.circuit_breaker.record_failure();
            ProviderError::unavailable(format!("finnhub transport error: {}", error.message()))
        })?;

        if response.status == 429 {
            return Err(ProviderError::rate_limited(
                "finnhub returned 429 too many requests",
            ));
        }

        if !response.is_success() {
            self.circuit_breaker.record_failure();
            return Err(ProviderError::unavailable(format!(
                "finnhub returned status {}",
                response.status
            )));
        }

        self.throttling.complete_one();
        self.circuit_breaker.record_success();
        Ok(response.body)
    }

    async fn fetch_quote(&self, req: &QuoteRequest) -> Result<Quote, ProviderError> {
        let key = cache_key(
            "quote",
            ProviderId::Finnhub.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Quote>(&key).fresh() {
            return Ok(cached);
        }

        let body = self
            .fetch_json(format!(
                "/quote?symbol={}",
                urlencoding::encode(req.symbol.as_str())
            ))
            .await?;

        let parsed: FinnhubQuote = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse finnhub quote: {error}"))
        })?;

        let price = parsed.current.unwrap_or(0.0);
        let timestamp = parsed.timestamp.unwrap_or(0);
        // Finnhub answers unknown symbols with a well-formed all-zero quote.
        if price == 0.0 && timestamp == 0 {
            return Err(ProviderError::no_data(
                "finnhub returned the zero-quote sentinel",
            ));
        }

        let quote = Quote::new(
            req.symbol.clone(),
            AssetType::Stock,
            price,
            parsed.change.unwrap_or(0.0),
            parsed.change_percent.unwrap_or(0.0),
            timestamp * 1_000,
            ProviderId::Finnhub,
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        self.cache
            .write(&key, &quote, ttl::EQUITY_QUOTE, ProviderId::Finnhub.as_str());
        Ok(quote)
    }

    async fn fetch_candles(&self, req: &CandlesRequest) -> Result<CandleSeries, ProviderError> {
        let key = cache_key(
            "candle",
            ProviderId::Finnhub.cache_tag(),
            req.symbol.as_str(),
            Some(&req.window_variant()),
        );
        if let Some(cached) = self.cache.lookup::<CandleSeries>(&key).fresh() {
            return Ok(cached);
        }

        let (from, to) = match req.window {
            CandleWindow::Between { from, to } => (from, to),
            CandleWindow::Latest { limit } => {
                let now = UtcDateTime::now().unix_seconds();
                let span = interval_seconds(req.interval) * limit as i64;
                (now - span, now)
            }
        };

        let body = self
            .fetch_json(format!(
                "/stock/candle?symbol={}&resolution={}&from={from}&to={to}",
                urlencoding::encode(req.symbol.as_str()),
                finnhub_resolution(req.interval),
            ))
            .await?;

        let parsed: FinnhubCandles = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse finnhub candles: {error}"))
        })?;

        if parsed.status != "ok" {
            return Err(ProviderError::no_data(format!(
                "finnhub candle status '{}'",
                parsed.status
            )));
        }

        let time = parsed.time.iter().map(|seconds| seconds * 1_000).collect();
        let series = CandleSeries::new(
            time,
            parsed.open,
            parsed.high,
            parsed.low,
            parsed.close,
            parsed.volume,
            ProviderId::Finnhub.as_str(),
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        if series.is_empty() {
            return Err(ProviderError::no_data("finnhub candle series is empty"));
        }

        let ttl_seconds = if req.interval.is_intraday() {
            ttl::EQUITY_CANDLE_INTRADAY
        } else {
            ttl::EQUITY_CANDLE_DAILY
        };
        self.cache
            .write(&key, &series, ttl_seconds, ProviderId::Finnhub.as_str());
        Ok(series)
    }

    async fn fetch_overview(&self, req: &OverviewRequest) -> Result<Overview, ProviderError> {
        let key = cache_key(
            "profile",
            ProviderId::Finnhub.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Overview>(&key).fresh() {
            return Ok(cached);
        }

        let body = self
            .fetch_json(format!(
                "/stock/profile2?symbol={}",
                urlencoding::encode(req.symbol.as_str())
            ))
            .await?;

        let fields: Map<String, Value> = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse finnhub profile: {error}"))
        })?;

        if fields.is_empty() {
            return Err(ProviderError::no_data(
                "finnhub profile is empty for this symbol",
            ));
        }

        let overview = Overview {
            source: ProviderId::Finnhub,
            fields,
        };
        self.cache
            .write(&key, &overview, ttl::OVERVIEW, ProviderId::Finnhub.as_str());
        Ok(overview)
    }

    async fn fetch_news(&self, req: &NewsRequest) -> Result<Vec<NewsItem>, ProviderError> {
        let key = cache_key(
            "news",
            ProviderId::Finnhub.cache_tag(),
            req.symbol.as_str(),
            Some(&format!("{}d", req.days)),
        );
        if let Some(cached) = self.cache.lookup::<Vec<NewsItem>>(&key).fresh() {
            return Ok(cached);
        }

        let now = UtcDateTime::now();
        let body = self
            .fetch_json(format!(
                "/company-news?symbol={}&from={}&to={}",
                urlencoding::encode(req.symbol.as_str()),
                now.minus_days(req.days).date_string(),
                now.date_string(),
            ))
            .await?;

        let parsed: Vec<FinnhubNewsItem> = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse finnhub news: {error}"))
        })?;

        let items: Vec<NewsItem> = parsed
            .into_iter()
            .map(|item| NewsItem {
                datetime: item.datetime.unwrap_or(0) * 1_000,
                headline: item.headline.unwrap_or_default(),
                source: item.source.unwrap_or_default(),
                summary: item.summary.unwrap_or_default(),
                url: item.url.unwrap_or_default(),
            })
            .collect();

        self.cache
            .write(&key, &items, ttl::NEWS, ProviderId::Finnhub.as_str());
        Ok(items)
    }

    async fn fetch_metrics(&self, req: &MetricsRequest) -> Result<Metrics, ProviderError> {
        let key = cache_key(
            "metrics",
            ProviderId::Finnhub.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Metrics>(&key).fresh() {
            return Ok(cached);
        }

        let body = self
            .fetch_json(format!(
                "/stock/metric?symbol={}&metric=all",
                urlencoding::encode(req.symbol.as_str())
            ))
            .await?;

        let parsed: FinnhubMetrics = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse finnhub metrics: {error}"))
        })?;

        let fields = parsed
            .metric
            .filter(|fields| !fields.is_empty())
            .ok_or_else(|| ProviderError::no_data("finnhub metrics are empty for this symbol"))?;

        let metrics = Metrics {
            source: ProviderId::Finnhub,
            fields,
        };
        self.cache
            .write(&key, &metrics, ttl::METRICS, ProviderId::Finnhub.as_str());
        Ok(metrics)
    }
}

impl MarketDataSource for FinnhubAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Finnhub
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(true, true, true, true, true)
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
        req: OverviewRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Overview, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_overview(&req).await })
    }

    fn news<'a>(
        &'a self,
        req: NewsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NewsItem>, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_news(&req).await })
    }

    fn metrics<'a>(
        &'a self,
        req: MetricsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Metrics, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_metrics(&req).await })
    }
}

/// Response from the `/quote` endpoint: single-letter fields.
#[derive(Debug, Deserialize)]
struct FinnhubQuote {
    /// Current price.
    #[serde(rename = "c")]
    current: Option<f64>,
    /// Absolute change.
    #[serde(rename = "d")]
    change: Option<f64>,
    /// Percent change.
    #[serde(rename = "dp")]
    change_percent: Option<f64>,
    /// Quote timestamp, epoch seconds.
    #[serde(rename = "t")]
    timestamp: Option<i64>,
}

/// Response from the `/stock/candle` endpoint: parallel arrays plus a
/// status tag (`ok` or `no_data`).
#[derive(Debug, Deserialize)]
struct FinnhubCandles {
    #[serde(rename = "s")]
    status: String,
    #[serde(rename = "t", default)]
    time: Vec<i64>,
    #[serde(rename = "o", default)]
    open: Vec<f64>,
    #[serde(rename = "h", default)]
    high: Vec<f64>,
    #[serde(rename = "l", default)]
    low: Vec<f64>,
    #[serde(rename = "c", default)]
    close: Vec<f64>,
    #[serde(rename = "v", default)]
    volume: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct FinnhubNewsItem {
    datetime: Option<i64>,
    headline: Option<String>,
    source: Option<String>,
    summary: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FinnhubMetrics {
    metric: Option<Map<String, Value>>,
}

fn finnhub_resolution(interval: Interval) -> &'static str {
    match interval {
        Interval::OneMinute => "1",
        Interval::FiveMinutes => "5",
        Interval::FifteenMinutes => "15",
        Interval::OneHour => "60",
        Interval::OneDay => "D",
    }
}

const fn interval_seconds(interval: Interval) -> i64 {
    match interval {
        Interval::OneMinute => 60,
        Interval::FiveMinutes => 300,
        Interval::FifteenMinutes => 900,
        Interval::OneHour => 3_600,
        Interval::OneDay => 86_400,
    }
}

#[cfg(test)]
mod tests {
    use marketmux_warehouse::{Warehouse, WarehouseConfig};

    use super::*;
    use crate::http::{HttpResponse, ScriptedHttpClient};
    use crate::provider::ProviderErrorKind;
    use crate::Symbol;

    fn adapter_with(client: &ScriptedHttpClient) -> (tempfile::TempDir, FinnhubAdapter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: dir.path().join("finnhub.duckdb"),
            max_pool_size: 2,
        })
        .expect("open warehouse");
        let adapter = FinnhubAdapter::new(
            Arc::new(client.clone()),
            CacheStore::new(warehouse),
            "https://finnhub.test/api/v1",
            "token",
            ThrottlingQueue::from_policy(&ThrottlePolicy::finnhub_default()),
        );
        (dir, adapter)
    }

    #[tokio::test]
    async fn quote_maps_single_letter_fields() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/quote",
            HttpResponse::ok_json(r#"{"c": 172.5, "d": -0.8, "dp": -0.46, "t": 1709251200}"#),
        );
        let (_dir, adapter) = adapter_with(&client);

        let quote = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect("quote");

        assert_eq!(quote.price, 172.5);
        assert_eq!(quote.change_abs, -0.8);
        assert_eq!(quote.change_pct, -0.46);
        assert_eq!(quote.timestamp, 1_709_251_200_000);
        assert_eq!(quote.source, ProviderId::Finnhub);
    }

    #[tokio::test]
    async fn zero_quote_sentinel_maps_to_no_data() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/quote",
            HttpResponse::ok_json(r#"{"c": 0, "d": null, "dp": null, "t": 0}"#),
        );
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("NOPE").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::NoData);
    }

    #[tokio::test]
    async fn http_429_maps_to_rate_limited() {
        let client = ScriptedHttpClient::new();
        client.route("/quote", HttpResponse::with_status(429, "slow down"));
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn no_data_candle_status_maps_to_no_data() {
        let client = ScriptedHttpClient::new();
        client.route("/stock/candle", HttpResponse::ok_json(r#"{"s": "no_data"}"#));
        let (_dir, adapter) = adapter_with(&client);

        let request = CandlesRequest::latest(
            Symbol::parse("AAPL").expect("symbol"),
            Interval::OneDay,
            30,
        )
        .expect("request");
        let err = adapter
            .fetch_candles(&request)
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::NoData);
    }

    #[tokio::test]
    async fn candles_convert_epoch_seconds_to_millis() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/stock/candle",
            HttpResponse::ok_json(
                r#"{"s": "ok", "t": [1709164800, 1709251200], "o": [1.0, 1.5], "h": [2.0, 2.5], "l": [0.5, 1.0], "c": [1.5, 2.0], "v": [100, 120]}"#,
            ),
        );
        let (_dir, adapter) = adapter_with(&client);

        let request = CandlesRequest::latest(
            Symbol::parse("AAPL").expect("symbol"),
            Interval::OneDay,
            30,
        )
        .expect("request");
        let series = adapter.fetch_candles(&request).await.expect("series");

        assert_eq!(series.time, vec![1_709_164_800_000, 1_709_251_200_000]);
        assert_eq!(series.source, "finnhub");
    }

    #[tokio::test]
    async fn exhausted_budget_fails_before_any_network_call() {
        let client = ScriptedHttpClient::new();
        client.route(
            "/quote",
            HttpResponse::ok_json(r#"{"c": 1.0, "d": 0, "dp": 0, "t": 1709251200}"#),
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: dir.path().join("finnhub.duckdb"),
            max_pool_size: 2,
        })
        .expect("open warehouse");
        let adapter = FinnhubAdapter::new(
            Arc::new(client.clone()),
            CacheStore::new(warehouse),
            "https://finnhub.test/api/v1",
            "token",
            ThrottlingQueue::from_policy(&ThrottlePolicy::per_minute(1)),
        );

        adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect("first call within budget");

        // Different symbol bypasses the cache; the bucket is empty now.
        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("MSFT").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::RateLimited);
        assert_eq!(client.call_count(), 1);
    }
}
