//! # Marketmux Core
//!
//! Market data aggregation and caching engine: one canonical interface over
//! heterogeneous, independently rate-limited, independently failing
//! upstream sources.
//!
//! ## Overview
//!
//! - **Canonical domain models** for quotes, candle series, fundamentals,
//!   and news
//! - **Provider adapters** (Alpha Vantage, Finnhub, Binance) that
//!   normalize, cache, and fail with typed errors
//! - **Aggregation router** with per-data-kind fallback ordering
//! - **Live feed manager** owning the streaming connection, hot cache, and
//!   reconnect state machine
//! - **History store** for the durable daily OHLCV archive
//! - **Job coordinator** granting at most one concurrent run per job id
//! - **Token-bucket throttling** and a **circuit breaker** for resilient
//!   upstream calls
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider adapters (Alpha Vantage, Finnhub, Binance) |
//! | [`cache`] | Typed TTL cache over the warehouse payload store |
//! | [`circuit_breaker`] | Circuit breaker for upstream calls |
//! | [`config`] | Engine configuration surface |
//! | [`domain`] | Domain models (Quote, CandleSeries, Symbol, ...) |
//! | [`engine`] | Production wiring with a start/stop lifecycle |
//! | [`feed`] | Live streaming feed manager and transports |
//! | [`history`] | Daily OHLCV archive with backfill/append |
//! | [`http`] | HTTP transport abstraction |
//! | [`jobs`] | Batch-job coordinator |
//! | [`provider`] | Adapter trait and request/error types |
//! | [`router`] | Aggregation router and fallback chains |
//! | [`source`] | Provider identifiers |
//! | [`throttling`] | Token-bucket rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use marketmux_core::{AssetType, Engine, EngineConfig, Symbol, Warehouse};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!     let engine = Engine::new(EngineConfig::from_env(), warehouse);
//!     engine.start();
//!
//!     let symbol = Symbol::parse("AAPL")?;
//!     let quote = engine.aggregator().quote(&symbol, AssetType::Stock).await?;
//!     println!("{}: ${:.2} via {}", quote.symbol, quote.price, quote.source);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Adapter failures are typed ([`ProviderError`]) and drive router
//! fallback; callers only see an [`AggregateError`] once every fallback
//! for a required field is exhausted. Optional data (news, metrics,
//! overview) degrades to empty/absent values instead of failing.
//!
//! ## Security
//!
//! - API keys are read from environment variables only (never logged)
//! - All storage statements are parameterized

pub mod adapters;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod feed;
pub mod history;
pub mod http;
pub mod jobs;
pub mod provider;
pub mod router;
pub mod source;
pub mod throttling;

// Re-export commonly used types at crate root for convenience

// Adapter implementations
pub use adapters::{AlphaVantageAdapter, BinanceRestAdapter, FinnhubAdapter};

// Caching
pub use cache::{cache_key, CacheLookup, CacheStore};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Configuration
pub use config::{EngineConfig, ProviderEndpoint};

// Domain models
pub use domain::{
    AssetType, CandleSeries, Interval, Metrics, NewsItem, Overview, Quote, RangeToken,
    SeriesStatus, Symbol, UtcDateTime,
};

// Engine wiring
pub use engine::Engine;

// Error types
pub use error::{CoreError, ValidationError};

// Live feed
pub use feed::{
    BinanceWsTransport, FeedConfig, FeedError, FeedState, LiveFeedManager, ScriptedTransport,
    StreamConn, StreamTransport,
};

// History archive
pub use history::{HistoryError, HistoryStore};

// HTTP transport types
pub use http::{
    HttpClient, HttpError, HttpRequest, HttpResponse, ReqwestHttpClient, ScriptedHttpClient,
};

// Job coordination
pub use jobs::{JobCoordinator, JobError};

// Provider contract
pub use provider::{
    CandleWindow, CandlesRequest, CapabilitySet, Endpoint, MarketDataSource, MetricsRequest,
    NewsRequest, OverviewRequest, ProviderError, ProviderErrorKind, QuoteRequest,
};

// Routing
pub use router::{AggregateError, Aggregator};

// Source identifiers
pub use source::ProviderId;

// Throttling
pub use throttling::{RetryBackoff, ThrottlePolicy, ThrottlingQueue};

// Warehouse (re-exported from marketmux-warehouse)
pub use marketmux_warehouse::{
    HistoryRow, JobRow, JobStatus, Warehouse, WarehouseConfig, WarehouseError,
};
