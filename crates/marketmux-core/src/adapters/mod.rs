//! Provider adapters: one per upstream source.
//!
//! | Adapter | Role | Operations |
//! |---------|------|------------|
//! | [`AlphaVantageAdapter`] | Primary equities | quote, candles, overview |
//! | [`FinnhubAdapter`] | Secondary equities (rate-capped) | quote, candles, overview, news, metrics |
//! | [`BinanceRestAdapter`] | Crypto REST/polling path | quote, candles |
//!
//! Each adapter normalizes its vendor's wire shape into the canonical
//! domain models, consults the cache before any network call, and writes
//! successful responses back with the operation's TTL.

mod alphavantage;
mod binance;
mod finnhub;

pub use alphavantage::AlphaVantageAdapter;
pub use binance::BinanceRestAdapter;
pub use finnhub::FinnhubAdapter;
