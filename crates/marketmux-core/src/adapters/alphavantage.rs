use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};
use tracing::debug;

use crate::cache::{cache_key, ttl, CacheStore};
use crate::circuit_breaker::CircuitBreaker;
use crate::http::{HttpClient, HttpRequest};
use crate::provider::{
    CandleWindow, CandlesRequest, CapabilitySet, MarketDataSource, MetricsRequest, NewsRequest,
    OverviewRequest, ProviderError, QuoteRequest,
};
use crate::{
    AssetType, CandleSeries, Interval, Metrics, NewsItem, Overview, ProviderId, Quote, UtcDateTime,
};

const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

/// Alpha Vantage adapter: the primary equities source.
///
/// Alpha Vantage signals quota exhaustion through a `Note`/`Information`
/// field in an otherwise-200 response; that marker is mapped to a
/// rate-limited error so the router falls back instead of caching garbage.
#[derive(Clone)]
pub struct AlphaVantageAdapter {
    http_client: Arc<dyn HttpClient>,
    cache: CacheStore,
    base_url: String,
    api_key: String,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl AlphaVantageAdapter {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        cache: CacheStore,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            cache,
            base_url: base_url.into(),
            api_key: api_key.into(),
            circuit_breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    pub fn with_default_base_url(
        http_client: Arc<dyn HttpClient>,
        cache: CacheStore,
        api_key: impl Into<String>,
    ) -> Self {
        Self::new(http_client, cache, DEFAULT_BASE_URL, api_key)
    }

    fn query_url(&self, function: &str, symbol: &str, extra: &str) -> String {
        format!(
            "{}/query?function={function}&symbol={}&apikey={}{extra}",
            self.base_url,
            urlencoding::encode(symbol),
            urlencoding::encode(&self.api_key),
        )
    }

    async fn fetch_json(&self, url: String) -> Result<String, ProviderError> {
        if !self.circuit_breaker.allow_request() {
            return Err(ProviderError::unavailable(
                "alphavantage circuit breaker is open",
            ));
        }

        let response = self
            .http_client
            .execute(HttpRequest::get(url))
            .await
            .map_err(|error| {
                self.circuit_breaker.record_failure();
                ProviderError::unavailable(format!(
                    "alphavantage transport error: {}",
                    error.message()
                ))
            })?;

        if !response.is_success() {
            self.circuit_breaker.record_failure();
            return Err(ProviderError::unavailable(format!(
                "alphavantage returned status {}",
                response.status
            )));
        }

        self.circuit_breaker.record_success();
        Ok(response.body)
    }

    async fn fetch_quote(&self, req: &QuoteRequest) -> Result<Quote, ProviderError> {
        let key = cache_key(
            "quote",
            ProviderId::Alphavantage.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Quote>(&key).fresh() {
            return Ok(cached);
        }

        let url = self.query_url("GLOBAL_QUOTE", req.symbol.as_str(), "");
        let body = self.fetch_json(url).await?;

        let parsed: AvQuoteResponse = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse alphavantage quote: {error}"))
        })?;
        reject_rate_limit_marker(parsed.note.as_deref(), parsed.information.as_deref())?;

        let global = parsed
            .quote
            .ok_or_else(|| ProviderError::no_data("alphavantage response lacks a quote object"))?;
        let price = parse_numeric_field("price", global.price.as_deref())?;
        let change_abs = parse_numeric_field("change", global.change.as_deref())?;
        let change_pct =
            parse_numeric_field("change percent", strip_percent(global.change_percent.as_deref()))?;

        let quote = Quote::new(
            req.symbol.clone(),
            AssetType::Stock,
            price,
            change_abs,
            change_pct,
            UtcDateTime::now().unix_millis(),
            ProviderId::Alphavantage,
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        self.cache
            .write(&key, &quote, ttl::EQUITY_QUOTE, ProviderId::Alphavantage.as_str());
        Ok(quote)
    }

    async fn fetch_candles(&self, req: &CandlesRequest) -> Result<CandleSeries, ProviderError> {
        let key = cache_key(
            "candle",
            ProviderId::Alphavantage.cache_tag(),
            req.symbol.as_str(),
            Some(&req.window_variant()),
        );
        if let Some(cached) = self.cache.lookup::<CandleSeries>(&key).fresh() {
            return Ok(cached);
        }

        let wants_full = match req.window {
            CandleWindow::Latest { limit } => limit > 100,
            CandleWindow::Between { .. } => true,
        };
        let url = match req.interval {
            Interval::OneDay => {
                let size = if wants_full { "full" } else { "compact" };
                self.query_url(
                    "TIME_SERIES_DAILY",
                    req.symbol.as_str(),
                    &format!("&outputsize={size}"),
                )
            }
            intraday => {
                let size = if wants_full { "full" } else { "compact" };
                self.query_url(
                    "TIME_SERIES_INTRADAY",
                    req.symbol.as_str(),
                    &format!("&interval={}&outputsize={size}", av_interval(intraday)),
                )
            }
        };
        let body = self.fetch_json(url).await?;

        let parsed: AvSeriesResponse = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse alphavantage series: {error}"))
        })?;
        reject_rate_limit_marker(parsed.note.as_deref(), parsed.information.as_deref())?;

        let series_object = parsed
            .time_series()
            .ok_or_else(|| ProviderError::no_data("alphavantage response lacks a time series"))?;

        // serde_json maps sort keys, and Alpha Vantage timestamps are ISO
        // strings, so iteration order is already chronological.
        let mut time = Vec::with_capacity(series_object.len());
        let mut open = Vec::with_capacity(series_object.len());
        let mut high = Vec::with_capacity(series_object.len());
        let mut low = Vec::with_capacity(series_object.len());
        let mut close = Vec::with_capacity(series_object.len());
        let mut volume = Vec::with_capacity(series_object.len());

        for (timestamp, bar) in series_object {
            let Some(bar) = bar.as_object() else {
                debug!(%timestamp, "skipping non-object alphavantage bar");
                continue;
            };
            let millis = parse_av_timestamp(timestamp)?;
            if let CandleWindow::Between { from, to } = req.window {
                let seconds = millis / 1_000;
                if seconds < from || seconds > to {
                    continue;
                }
            }

            time.push(millis);
            open.push(parse_bar_field(bar, "1. open")?);
            high.push(parse_bar_field(bar, "2. high")?);
            low.push(parse_bar_field(bar, "3. low")?);
            close.push(parse_bar_field(bar, "4. close")?);
            volume.push(parse_bar_field(bar, "5. volume").unwrap_or(0.0));
        }

        if let CandleWindow::Latest { limit } = req.window {
            let excess = time.len().saturating_sub(limit);
            if excess > 0 {
                time.drain(..excess);
                open.drain(..excess);
                high.drain(..excess);
                low.drain(..excess);
                close.drain(..excess);
                volume.drain(..excess);
            }
        }

        if time.is_empty() {
            return Err(ProviderError::no_data(
                "alphavantage series is empty for the requested window",
            ));
        }

        let series = CandleSeries::new(
            time,
            open,
            high,
            low,
            close,
            volume,
            ProviderId::Alphavantage.as_str(),
        )
        .map_err(|error| ProviderError::internal(error.to_string()))?;

        let ttl_seconds = if req.interval.is_intraday() {
            ttl::EQUITY_CANDLE_INTRADAY
        } else {
            ttl::EQUITY_CANDLE_DAILY
        };
        self.cache
            .write(&key, &series, ttl_seconds, ProviderId::Alphavantage.as_str());
        Ok(series)
    }

    async fn fetch_overview(&self, req: &OverviewRequest) -> Result<Overview, ProviderError> {
        let key = cache_key(
            "overview",
            ProviderId::Alphavantage.cache_tag(),
            req.symbol.as_str(),
            None,
        );
        if let Some(cached) = self.cache.lookup::<Overview>(&key).fresh() {
            return Ok(cached);
        }

        let url = self.query_url("OVERVIEW", req.symbol.as_str(), "");
        let body = self.fetch_json(url).await?;

        let fields: Map<String, Value> = serde_json::from_str(&body).map_err(|error| {
            ProviderError::internal(format!("failed to parse alphavantage overview: {error}"))
        })?;
        reject_rate_limit_marker(
            fields.get("Note").and_then(Value::as_str),
            fields.get("Information").and_then(Value::as_str),
        )?;

        if fields.is_empty() || !fields.contains_key("Symbol") {
            return Err(ProviderError::no_data(
                "alphavantage overview is empty for this symbol",
            ));
        }

        let overview = Overview {
            source: ProviderId::Alphavantage,
            fields,
        };
        self.cache
            .write(&key, &overview, ttl::OVERVIEW, ProviderId::Alphavantage.as_str());
        Ok(overview)
    }
}

impl MarketDataSource for AlphaVantageAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Alphavantage
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(true, true, true, false, false)
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
        _req: NewsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<NewsItem>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ProviderError::invalid_request(
                "alphavantage does not serve news",
            ))
        })
    }

    fn metrics<'a>(
        &'a self,
        _req: MetricsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Metrics, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            Err(ProviderError::invalid_request(
                "alphavantage does not serve key metrics",
            ))
        })
    }
}

#[derive(Debug, Deserialize)]
struct AvQuoteResponse {
    #[serde(rename = "Global Quote")]
    quote: Option<AvGlobalQuote>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvGlobalQuote {
    #[serde(rename = "05. price")]
    price: Option<String>,
    #[serde(rename = "09. change")]
    change: Option<String>,
    #[serde(rename = "10. change percent")]
    change_percent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AvSeriesResponse {
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl AvSeriesResponse {
    fn time_series(&self) -> Option<&Map<String, Value>> {
        self.rest
            .iter()
            .find(|(key, _)| key.starts_with("Time Series"))
            .and_then(|(_, value)| value.as_object())
    }
}

fn reject_rate_limit_marker(
    note: Option<&str>,
    information: Option<&str>,
) -> Result<(), ProviderError> {
    if let Some(marker) = note.or(information) {
        return Err(ProviderError::rate_limited(format!(
            "alphavantage quota marker: {marker}"
        )));
    }
    Ok(())
}

fn strip_percent(value: Option<&str>) -> Option<&str> {
    value.map(|value| value.trim_end_matches('%'))
}

fn parse_numeric_field(field: &str, value: Option<&str>) -> Result<f64, ProviderError> {
    let raw = value
        .ok_or_else(|| ProviderError::no_data(format!("alphavantage quote lacks '{field}'")))?;
    raw.trim().parse::<f64>().map_err(|_| {
        ProviderError::no_data(format!("alphavantage '{field}' is not numeric: '{raw}'"))
    })
}

fn parse_bar_field(bar: &Map<String, Value>, field: &str) -> Result<f64, ProviderError> {
    let raw = bar
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::no_data(format!("alphavantage bar lacks '{field}'")))?;
    raw.trim()
        .parse::<f64>()
        .map_err(|_| ProviderError::no_data(format!("alphavantage '{field}' is not numeric")))
}

/// Alpha Vantage stamps daily bars `YYYY-MM-DD` and intraday bars
/// `YYYY-MM-DD HH:MM:SS` (exchange-local, treated as UTC here). Both are
/// normalized to epoch milliseconds.
fn parse_av_timestamp(value: &str) -> Result<i64, ProviderError> {
    if value.len() == 10 {
        let date = Date::parse(value, format_description!("[year]-[month]-[day]"))
            .map_err(|_| ProviderError::no_data(format!("invalid alphavantage date '{value}'")))?;
        return Ok(date.midnight().assume_utc().unix_timestamp() * 1_000);
    }

    let datetime = PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map_err(|_| ProviderError::no_data(format!("invalid alphavantage timestamp '{value}'")))?;
    Ok(datetime.assume_utc().unix_timestamp() * 1_000)
}

fn av_interval(interval: Interval) -> &'static str {
    match interval {
        Interval::OneMinute => "1min",
        Interval::FiveMinutes => "5min",
        Interval::FifteenMinutes => "15min",
        Interval::OneHour => "60min",
        Interval::OneDay => "daily",
    }
}

#[cfg(test)]
mod tests {
    use marketmux_warehouse::{Warehouse, WarehouseConfig};

    use super::*;
    use crate::http::{HttpResponse, ScriptedHttpClient};
    use crate::provider::ProviderErrorKind;
    use crate::Symbol;

    fn adapter_with(client: &ScriptedHttpClient) -> (tempfile::TempDir, AlphaVantageAdapter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig {
            db_path: dir.path().join("av.duckdb"),
            max_pool_size: 2,
        })
        .expect("open warehouse");
        let adapter = AlphaVantageAdapter::new(
            Arc::new(client.clone()),
            CacheStore::new(warehouse),
            "https://av.test",
            "demo",
        );
        (dir, adapter)
    }

    fn quote_body() -> &'static str {
        r#"{"Global Quote": {"01. symbol": "AAPL", "05. price": "187.3000", "09. change": "1.2000", "10. change percent": "0.6450%"}}"#
    }

    #[tokio::test]
    async fn quote_normalizes_global_quote_fields() {
        let client = ScriptedHttpClient::new();
        client.route("GLOBAL_QUOTE", HttpResponse::ok_json(quote_body()));
        let (_dir, adapter) = adapter_with(&client);

        let quote = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect("quote");

        assert_eq!(quote.price, 187.3);
        assert_eq!(quote.change_abs, 1.2);
        assert_eq!(quote.change_pct, 0.645);
        assert_eq!(quote.source, ProviderId::Alphavantage);
        assert!(!quote.is_stale);
    }

    #[tokio::test]
    async fn quote_cache_hit_makes_no_network_call() {
        let client = ScriptedHttpClient::new();
        client.route("GLOBAL_QUOTE", HttpResponse::ok_json(quote_body()));
        let (_dir, adapter) = adapter_with(&client);
        let request = QuoteRequest::new(Symbol::parse("AAPL").expect("symbol"));

        adapter.fetch_quote(&request).await.expect("first fetch");
        adapter.fetch_quote(&request).await.expect("cached fetch");

        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn quota_note_maps_to_rate_limited() {
        let client = ScriptedHttpClient::new();
        client.route(
            "GLOBAL_QUOTE",
            HttpResponse::ok_json(r#"{"Note": "Thank you for using Alpha Vantage!"}"#),
        );
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn empty_global_quote_maps_to_no_data() {
        let client = ScriptedHttpClient::new();
        client.route(
            "GLOBAL_QUOTE",
            HttpResponse::ok_json(r#"{"Global Quote": {}}"#),
        );
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("NOPE").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::NoData);
    }

    #[tokio::test]
    async fn daily_series_is_ascending_and_trimmed_to_limit() {
        let client = ScriptedHttpClient::new();
        client.route(
            "TIME_SERIES_DAILY",
            HttpResponse::ok_json(
                r#"{"Time Series (Daily)": {
                    "2024-03-01": {"1. open": "1", "2. high": "2", "3. low": "0.5", "4. close": "1.5", "5. volume": "100"},
                    "2024-02-29": {"1. open": "0.9", "2. high": "1.1", "3. low": "0.8", "4. close": "1.0", "5. volume": "90"},
                    "2024-02-28": {"1. open": "0.8", "2. high": "0.9", "3. low": "0.7", "4. close": "0.85", "5. volume": "80"}
                }}"#,
            ),
        );
        let (_dir, adapter) = adapter_with(&client);

        let request = CandlesRequest::latest(
            Symbol::parse("AAPL").expect("symbol"),
            Interval::OneDay,
            2,
        )
        .expect("request");
        let series = adapter.fetch_candles(&request).await.expect("series");

        assert_eq!(series.len(), 2);
        assert!(series.time[0] < series.time[1]);
        assert_eq!(series.close, vec![1.0, 1.5]);
        assert_eq!(series.source, "alphavantage");
    }

    #[tokio::test]
    async fn http_failure_maps_to_unavailable() {
        let client = ScriptedHttpClient::new();
        client.route("GLOBAL_QUOTE", HttpResponse::with_status(500, "boom"));
        let (_dir, adapter) = adapter_with(&client);

        let err = adapter
            .fetch_quote(&QuoteRequest::new(Symbol::parse("AAPL").expect("symbol")))
            .await
            .expect_err("must fail");
        assert_eq!(err.kind(), ProviderErrorKind::Unavailable);
    }
}
