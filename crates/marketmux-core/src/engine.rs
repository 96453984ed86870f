//! Engine assembly: one singly-owned service instance.
//!
//! All process-wide state (hot cache, tracked symbols, the streaming
//! connection handle) lives inside the components wired here, not in
//! ambient globals, so the engine has a defined start/stop lifecycle and
//! every piece can be substituted in tests.

use std::sync::Arc;

use marketmux_warehouse::Warehouse;

use crate::adapters::{AlphaVantageAdapter, BinanceRestAdapter, FinnhubAdapter};
use crate::cache::CacheStore;
use crate::config::EngineConfig;
use crate::feed::{BinanceWsTransport, FeedConfig, LiveFeedManager};
use crate::history::HistoryStore;
use crate::http::{HttpClient, ReqwestHttpClient};
use crate::jobs::JobCoordinator;
use crate::router::Aggregator;
use crate::throttling::{ThrottlePolicy, ThrottlingQueue};

/// The assembled market-data engine.
pub struct Engine {
    aggregator: Arc<Aggregator>,
    history: HistoryStore,
    jobs: JobCoordinator,
}

impl Engine {
    /// Wire the production engine: reqwest transport, tungstenite stream,
    /// and the shared warehouse-backed cache.
    pub fn new(config: EngineConfig, warehouse: Warehouse) -> Self {
        let cache = CacheStore::new(warehouse.clone());
        let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());

        let primary = Arc::new(AlphaVantageAdapter::new(
            Arc::clone(&http),
            cache.clone(),
            config.alphavantage.base_url.clone(),
            config.alphavantage.api_key.clone(),
        ));
        let secondary = Arc::new(FinnhubAdapter::new(
            Arc::clone(&http),
            cache.clone(),
            config.finnhub.base_url.clone(),
            config.finnhub.api_key.clone(),
            ThrottlingQueue::from_policy(&ThrottlePolicy::per_minute(
                config.finnhub_quota_per_minute,
            )),
        ));
        let crypto = Arc::new(BinanceRestAdapter::new(
            Arc::clone(&http),
            cache.clone(),
            config.binance_rest_url.clone(),
        ));

        let feed = LiveFeedManager::new(
            Arc::new(BinanceWsTransport::new(config.binance_ws_url.clone())),
            crypto.clone(),
            cache,
            FeedConfig::default(),
        );

        let aggregator = Arc::new(Aggregator::new(primary, secondary, crypto, feed));
        let history = HistoryStore::new(warehouse.clone(), Arc::clone(&aggregator));
        let jobs = JobCoordinator::new(warehouse);

        Self {
            aggregator,
            history,
            jobs,
        }
    }

    /// Bring the live feed up. Request-path components need no startup.
    pub fn start(&self) {
        self.aggregator.feed().start();
    }

    /// Stop the live feed driver. In-flight background jobs run to
    /// completion; their outcomes stay observable through job status.
    pub fn stop(&self) {
        self.aggregator.feed().stop();
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn jobs(&self) -> &JobCoordinator {
        &self.jobs
    }
}
