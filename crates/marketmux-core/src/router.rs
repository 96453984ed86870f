//! Aggregation router: the unified entry point over every provider.
//!
//! Fallback ordering is provider-specific per data kind, not a uniform
//! retry. The secondary equities provider is the canonical source for
//! news/metrics/profile fallback, so those operations go secondary-only by
//! design. Adapter failures are logged as warnings and drive fallback; only
//! exhaustion of every fallback for required data (quotes, candles) becomes
//! an [`AggregateError`]. Optional data degrades to empty/absent instead.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tracing::warn;

use crate::feed::LiveFeedManager;
use crate::provider::{
    CandlesRequest, Endpoint, MarketDataSource, MetricsRequest, NewsRequest, OverviewRequest,
    ProviderError, ProviderFuture, QuoteRequest,
};
use crate::{
    AssetType, CandleSeries, Metrics, NewsItem, Overview, ProviderId, Quote, RangeToken, Symbol,
    UtcDateTime,
};

/// Trailing window for news requests, in calendar days.
const NEWS_WINDOW_DAYS: i64 = 7;

/// Failure after exhausting every fallback provider for a required field.
#[derive(Debug)]
pub struct AggregateError {
    pub endpoint: Endpoint,
    pub symbol: Symbol,
    pub attempts: Vec<(ProviderId, ProviderError)>,
}

impl Display for AggregateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "all providers failed for {} {} after {} attempt(s)",
            self.endpoint,
            self.symbol,
            self.attempts.len()
        )
    }
}

impl std::error::Error for AggregateError {}

/// The unified market-data entry point.
///
/// Holds one adapter per upstream plus the live feed manager, and selects
/// the fallback chain per (data kind, asset type). One instance serves all
/// in-flight requests.
#[derive(Clone)]
pub struct Aggregator {
    primary: Arc<dyn MarketDataSource>,
    secondary: Arc<dyn MarketDataSource>,
    crypto: Arc<dyn MarketDataSource>,
    feed: LiveFeedManager,
}

impl Aggregator {
    pub fn new(
        primary: Arc<dyn MarketDataSource>,
        secondary: Arc<dyn MarketDataSource>,
        crypto: Arc<dyn MarketDataSource>,
        feed: LiveFeedManager,
    ) -> Self {
        Self {
            primary,
            secondary,
            crypto,
            feed,
        }
    }

    pub fn feed(&self) -> &LiveFeedManager {
        &self.feed
    }

    /// Fetch the canonical quote for a symbol.
    ///
    /// CRYPTO routes through the live feed (hot cache, persisted cache,
    /// REST, stale-serve, in that order) and keeps the symbol subscribed for
    /// future streaming updates. STOCK tries the primary provider and falls
    /// back to the secondary.
    pub async fn quote(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
    ) -> Result<Quote, AggregateError> {
        match asset_type {
            AssetType::Crypto => {
                self.feed.track_symbol(symbol);
                self.feed.quote(symbol).await.map_err(|error| {
                    warn!(symbol = %symbol, provider = %ProviderId::Binance, %error, "quote failed");
                    AggregateError {
                        endpoint: Endpoint::Quote,
                        symbol: symbol.clone(),
                        attempts: vec![(ProviderId::Binance, error)],
                    }
                })
            }
            AssetType::Stock => {
                let request = QuoteRequest::new(symbol.clone());
                self.try_chain(
                    Endpoint::Quote,
                    symbol,
                    &[Arc::clone(&self.primary), Arc::clone(&self.secondary)],
                    move |source| source.quote(request.clone()),
                )
                .await
            }
        }
    }

    /// Fetch a candle series for a logical range token (`1d, 1w, 1m, 3m,
    /// 6m, 1y`; anything else maps to `6m`).
    ///
    /// CRYPTO resolves the token through the fixed interval/limit table.
    /// STOCK asks the primary provider first; on failure the token is
    /// recomputed into an explicit from/to window for the secondary.
    pub async fn candles(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
        range: &str,
    ) -> Result<CandleSeries, AggregateError> {
        let token = RangeToken::parse_lossy(range);
        match asset_type {
            AssetType::Crypto => {
                let (interval, limit) = token.crypto_plan();
                let request = CandlesRequest::latest(symbol.clone(), interval, limit)
                    .map_err(|error| AggregateError {
                        endpoint: Endpoint::Candles,
                        symbol: symbol.clone(),
                        attempts: vec![(ProviderId::Binance, error)],
                    })?;
                self.try_chain(
                    Endpoint::Candles,
                    symbol,
                    &[Arc::clone(&self.crypto)],
                    move |source| source.candles(request.clone()),
                )
                .await
            }
            AssetType::Stock => {
                let mut attempts = Vec::new();

                let (interval, limit) = token.equity_plan();
                match CandlesRequest::latest(symbol.clone(), interval, limit) {
                    Ok(request) => match self.primary.candles(request).await {
                        Ok(series) => return Ok(series),
                        Err(error) => {
                            warn!(symbol = %symbol, provider = %self.primary.id(), %error, "candles failed");
                            attempts.push((self.primary.id(), error));
                        }
                    },
                    Err(error) => attempts.push((self.primary.id(), error)),
                }

                let (fallback_interval, window_days) = token.fallback_window();
                let to = UtcDateTime::now().unix_seconds();
                let from = to - window_days * 86_400;
                match CandlesRequest::between(symbol.clone(), fallback_interval, from, to) {
                    Ok(request) => match self.secondary.candles(request).await {
                        Ok(series) => return Ok(series),
                        Err(error) => {
                            warn!(symbol = %symbol, provider = %self.secondary.id(), %error, "candles failed");
                            attempts.push((self.secondary.id(), error));
                        }
                    },
                    Err(error) => attempts.push((self.secondary.id(), error)),
                }

                Err(AggregateError {
                    endpoint: Endpoint::Candles,
                    symbol: symbol.clone(),
                    attempts,
                })
            }
        }
    }

    /// Fetch the fundamentals overview. Crypto has no fundamentals, so
    /// CRYPTO is always `None` (not an error); STOCK degrades to `None`
    /// once both providers fail.
    pub async fn overview(&self, symbol: &Symbol, asset_type: AssetType) -> Option<Overview> {
        if asset_type == AssetType::Crypto {
            return None;
        }

        let request = OverviewRequest {
            symbol: symbol.clone(),
        };
        let result = self
            .try_chain(
                Endpoint::Overview,
                symbol,
                &[Arc::clone(&self.primary), Arc::clone(&self.secondary)],
                move |source| source.overview(request.clone()),
            )
            .await;
        result.ok()
    }

    /// Fetch news over the trailing seven days. News is non-critical:
    /// CRYPTO and any failure yield an empty sequence.
    pub async fn news(&self, symbol: &Symbol, asset_type: AssetType) -> Vec<NewsItem> {
        if asset_type == AssetType::Crypto {
            return Vec::new();
        }

        let request = NewsRequest {
            symbol: symbol.clone(),
            days: NEWS_WINDOW_DAYS,
        };
        match self.secondary.news(request).await {
            Ok(items) => items,
            Err(error) => {
                warn!(symbol = %symbol, provider = %self.secondary.id(), %error, "news failed");
                Vec::new()
            }
        }
    }

    /// Fetch key metrics. CRYPTO and any failure yield `None`.
    pub async fn metrics(&self, symbol: &Symbol, asset_type: AssetType) -> Option<Metrics> {
        if asset_type == AssetType::Crypto {
            return None;
        }

        let request = MetricsRequest {
            symbol: symbol.clone(),
        };
        match self.secondary.metrics(request).await {
            Ok(metrics) => Some(metrics),
            Err(error) => {
                warn!(symbol = %symbol, provider = %self.secondary.id(), %error, "metrics failed");
                None
            }
        }
    }

    /// Fetch a trailing daily series of `days` bars, used by the history
    /// store's backfill and append paths.
    pub async fn daily_series(
        &self,
        symbol: &Symbol,
        asset_type: AssetType,
        days: usize,
    ) -> Result<CandleSeries, AggregateError> {
        match asset_type {
            AssetType::Crypto => {
                let request =
                    CandlesRequest::latest(symbol.clone(), crate::Interval::OneDay, days)
                        .map_err(|error| AggregateError {
                            endpoint: Endpoint::Candles,
                            symbol: symbol.clone(),
                            attempts: vec![(ProviderId::Binance, error)],
                        })?;
                self.try_chain(
                    Endpoint::Candles,
                    symbol,
                    &[Arc::clone(&self.crypto)],
                    move |source| source.candles(request.clone()),
                )
                .await
            }
            AssetType::Stock => {
                let mut attempts = Vec::new();

                match CandlesRequest::latest(symbol.clone(), crate::Interval::OneDay, days) {
                    Ok(request) => match self.primary.candles(request).await {
                        Ok(series) => return Ok(series),
                        Err(error) => {
                            warn!(symbol = %symbol, provider = %self.primary.id(), %error, "daily series failed");
                            attempts.push((self.primary.id(), error));
                        }
                    },
                    Err(error) => attempts.push((self.primary.id(), error)),
                }

                let to = UtcDateTime::now().unix_seconds();
                let from = to - days as i64 * 86_400;
                match CandlesRequest::between(symbol.clone(), crate::Interval::OneDay, from, to) {
                    Ok(request) => match self.secondary.candles(request).await {
                        Ok(series) => return Ok(series),
                        Err(error) => {
                            warn!(symbol = %symbol, provider = %self.secondary.id(), %error, "daily series failed");
                            attempts.push((self.secondary.id(), error));
                        }
                    },
                    Err(error) => attempts.push((self.secondary.id(), error)),
                }

                Err(AggregateError {
                    endpoint: Endpoint::Candles,
                    symbol: symbol.clone(),
                    attempts,
                })
            }
        }
    }

    /// Walk a fixed provider chain, accumulating per-provider failures.
    async fn try_chain<T, F>(
        &self,
        endpoint: Endpoint,
        symbol: &Symbol,
        chain: &[Arc<dyn MarketDataSource>],
        invoke: F,
    ) -> Result<T, AggregateError>
    where
        F: for<'a> Fn(&'a dyn MarketDataSource) -> ProviderFuture<'a, T>,
    {
        let mut attempts = Vec::with_capacity(chain.len());

        for source in chain {
            if !source.capabilities().supports(endpoint) {
                attempts.push((
                    source.id(),
                    ProviderError::invalid_request(format!(
                        "provider '{}' does not support {endpoint}",
                        source.id()
                    )),
                ));
                continue;
            }

            match invoke(source.as_ref()).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    warn!(symbol = %symbol, provider = %source.id(), %error, "{endpoint} failed");
                    attempts.push((source.id(), error));
                }
            }
        }

        Err(AggregateError {
            endpoint,
            symbol: symbol.clone(),
            attempts,
        })
    }
}
