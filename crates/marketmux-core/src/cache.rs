//! Typed caching layer over the warehouse payload store.
//!
//! Staleness is TTL-only: an entry past `expires_at` is stale, full stop.
//! There is no secondary freshness check against the underlying market fact;
//! this trades freshness for outbound-call budget on purpose. Stale entries
//! are never deleted and stay readable so the crypto REST fallback can serve
//! them marked stale.
//!
//! Storage and parse failures never propagate to readers: a payload that
//! fails to deserialize is treated as a miss (triggering a refetch), and a
//! failed write leaves the fetched payload to be returned regardless.

use marketmux_warehouse::Warehouse;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::UtcDateTime;

/// Operation-specific TTLs, in seconds. Shorter-lived data trades freshness
/// for outbound-call budget; fundamentals rarely change intraday.
pub mod ttl {
    pub const EQUITY_QUOTE: i64 = 900;
    pub const EQUITY_CANDLE_INTRADAY: i64 = 1_800;
    pub const EQUITY_CANDLE_DAILY: i64 = 86_400;
    pub const OVERVIEW: i64 = 604_800;
    pub const NEWS: i64 = 1_800;
    pub const METRICS: i64 = 3_600;
    pub const CRYPTO_QUOTE: i64 = 60;
    pub const CRYPTO_CANDLE: i64 = 300;
}

/// Build a colon-delimited cache key: `<kind>:<provider>:<symbol>[:<variant>]`.
pub fn cache_key(kind: &str, provider_tag: &str, symbol: &str, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{kind}:{provider_tag}:{symbol}:{variant}"),
        None => format!("{kind}:{provider_tag}:{symbol}"),
    }
}

/// Outcome of a typed cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// Entry present and within its TTL.
    Fresh(T),
    /// Entry present but past its TTL.
    Stale(T),
    /// No entry, or a payload that failed to parse.
    Miss,
}

impl<T> CacheLookup<T> {
    /// The payload only when it is still fresh.
    pub fn fresh(self) -> Option<T> {
        match self {
            Self::Fresh(value) => Some(value),
            Self::Stale(_) | Self::Miss => None,
        }
    }

    /// The payload regardless of freshness, with its staleness flag.
    pub fn any(self) -> Option<(T, bool)> {
        match self {
            Self::Fresh(value) => Some((value, false)),
            Self::Stale(value) => Some((value, true)),
            Self::Miss => None,
        }
    }
}

/// Typed key-payload cache shared by every adapter.
#[derive(Clone)]
pub struct CacheStore {
    warehouse: Warehouse,
}

impl CacheStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self { warehouse }
    }

    /// Look up and deserialize a cached payload.
    ///
    /// Storage errors and malformed payloads both degrade to
    /// [`CacheLookup::Miss`]; readers never observe a failure.
    pub fn lookup<T: DeserializeOwned>(&self, key: &str) -> CacheLookup<T> {
        let row = match self.warehouse.cache_get(key) {
            Ok(Some(row)) => row,
            Ok(None) => return CacheLookup::Miss,
            Err(error) => {
                warn!(key, %error, "cache read failed, treating as miss");
                return CacheLookup::Miss;
            }
        };

        let value: T = match serde_json::from_str(&row.payload) {
            Ok(value) => value,
            Err(error) => {
                debug!(key, %error, "malformed cache payload, treating as miss");
                return CacheLookup::Miss;
            }
        };

        if UtcDateTime::now().unix_seconds() > row.expires_at {
            CacheLookup::Stale(value)
        } else {
            CacheLookup::Fresh(value)
        }
    }

    /// Serialize and write a payload, replacing any prior entry for the key.
    ///
    /// Write failures are logged and swallowed; the caller already holds the
    /// fetched payload and a missed write only costs a future refetch.
    pub fn write<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: i64, source: &str) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(key, %error, "failed to serialize cache payload");
                return;
            }
        };

        let expires_at = UtcDateTime::now().unix_seconds() + ttl_seconds;
        if let Err(error) = self.warehouse.cache_put(key, &payload, expires_at, source) {
            warn!(key, %error, "cache write failed");
        }
    }
}
