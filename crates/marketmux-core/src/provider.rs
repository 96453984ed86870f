//! Provider adapter contract and request/response types.
//!
//! This module defines the adapter trait (`MarketDataSource`) every upstream
//! implementation must follow, along with the request types for each
//! operation.
//!
//! # Operations
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | Quote | [`QuoteRequest`] | [`Quote`] |
//! | Candles | [`CandlesRequest`] | [`CandleSeries`] |
//! | Overview | [`OverviewRequest`] | [`Overview`] |
//! | News | [`NewsRequest`] | `Vec<NewsItem>` |
//! | Metrics | [`MetricsRequest`] | [`Metrics`] |
//!
//! Every operation is cache-first: a fresh cache entry is returned without
//! any network call, a miss performs exactly one upstream call, and success
//! writes the normalized payload back with the operation's TTL.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::{CandleSeries, Interval, Metrics, NewsItem, Overview, ProviderId, Quote, Symbol};

/// Data operation type used for routing and capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Quote,
    Candles,
    Overview,
    News,
    Metrics,
}

impl Endpoint {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::Candles => "candles",
            Self::Overview => "overview",
            Self::News => "news",
            Self::Metrics => "metrics",
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported operation matrix for a provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub quote: bool,
    pub candles: bool,
    pub overview: bool,
    pub news: bool,
    pub metrics: bool,
}

impl CapabilitySet {
    pub const fn new(quote: bool, candles: bool, overview: bool, news: bool, metrics: bool) -> Self {
        Self {
            quote,
            candles,
            overview,
            news,
            metrics,
        }
    }

    pub const fn supports(self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Quote => self.quote,
            Endpoint::Candles => self.candles,
            Endpoint::Overview => self.overview,
            Endpoint::News => self.news,
            Endpoint::Metrics => self.metrics,
        }
    }
}

/// Adapter-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network or HTTP failure reaching the upstream.
    Unavailable,
    /// Upstream signaled quota exhaustion (marker field or HTTP 429).
    RateLimited,
    /// Well-formed response lacking the expected data.
    NoData,
    /// The request itself is invalid for this provider.
    InvalidRequest,
    /// Unexpected adapter-internal failure.
    Internal,
}

/// Structured adapter error used by router fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
    retryable: bool,
}

impl ProviderError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Unavailable,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::RateLimited,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::NoData,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::InvalidRequest,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Internal,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Unavailable => "provider.unavailable",
            ProviderErrorKind::RateLimited => "provider.rate_limited",
            ProviderErrorKind::NoData => "provider.no_data",
            ProviderErrorKind::InvalidRequest => "provider.invalid_request",
            ProviderErrorKind::Internal => "provider.internal",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for ProviderError {}

/// Request payload for quote operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub symbol: Symbol,
}

impl QuoteRequest {
    pub fn new(symbol: Symbol) -> Self {
        Self { symbol }
    }
}

/// Window selector for candle operations: either the most recent `limit`
/// bars, or an explicit epoch-second from/to range (the secondary equities
/// fallback path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleWindow {
    Latest { limit: usize },
    Between { from: i64, to: i64 },
}

/// Request payload for candle operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandlesRequest {
    pub symbol: Symbol,
    pub interval: Interval,
    pub window: CandleWindow,
}

impl CandlesRequest {
    pub fn latest(
        symbol: Symbol,
        interval: Interval,
        limit: usize,
    ) -> Result<Self, ProviderError> {
        if limit == 0 {
            return Err(ProviderError::invalid_request(
                "candles request limit must be greater than zero",
            ));
        }
        Ok(Self {
            symbol,
            interval,
            window: CandleWindow::Latest { limit },
        })
    }

    pub fn between(
        symbol: Symbol,
        interval: Interval,
        from: i64,
        to: i64,
    ) -> Result<Self, ProviderError> {
        if from >= to {
            return Err(ProviderError::invalid_request(
                "candles request window must satisfy from < to",
            ));
        }
        Ok(Self {
            symbol,
            interval,
            window: CandleWindow::Between { from, to },
        })
    }

    /// Stable cache-key variant for this request's window.
    pub fn window_variant(&self) -> String {
        match self.window {
            CandleWindow::Latest { limit } => format!("{}:{limit}", self.interval),
            CandleWindow::Between { from, to } => {
                let days = ((to - from) / 86_400).max(1);
                format!("{}:{days}d", self.interval)
            }
        }
    }
}

/// Request payload for overview/profile operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverviewRequest {
    pub symbol: Symbol,
}

/// Request payload for news operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsRequest {
    pub symbol: Symbol,
    /// Trailing window in calendar days.
    pub days: i64,
}

/// Request payload for key-metrics operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsRequest {
    pub symbol: Symbol,
}

pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Upstream provider adapter contract.
///
/// All data providers implement this trait to be used with the aggregation
/// router. Methods return boxed futures so adapters stay object-safe.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one adapter instance serves every
/// in-flight request concurrently.
pub trait MarketDataSource: Send + Sync {
    /// Returns the unique provider identifier.
    fn id(&self) -> ProviderId;

    /// Returns the set of supported operations.
    fn capabilities(&self) -> CapabilitySet;

    /// Fetch a normalized quote for one symbol.
    fn quote<'a>(&'a self, req: QuoteRequest) -> ProviderFuture<'a, Quote>;

    /// Fetch a normalized candle series.
    fn candles<'a>(&'a self, req: CandlesRequest) -> ProviderFuture<'a, CandleSeries>;

    /// Fetch the fundamentals overview/profile for an equity.
    fn overview<'a>(&'a self, req: OverviewRequest) -> ProviderFuture<'a, Overview>;

    /// Fetch recent news articles for an equity.
    fn news<'a>(&'a self, req: NewsRequest) -> ProviderFuture<'a, Vec<NewsItem>>;

    /// Fetch key metrics for an equity.
    fn metrics<'a>(&'a self, req: MetricsRequest) -> ProviderFuture<'a, Metrics>;
}
