//! Canonical domain types for marketmux market data.
//!
//! Every adapter normalizes its vendor's wire shape into these models, so
//! callers see one representation regardless of which upstream answered.
//! Construction validates invariants (finite prices, equal-length ascending
//! candle arrays, UTC-only timestamps); invalid states are unrepresentable
//! past the adapter boundary.

mod interval;
mod models;
mod range;
mod symbol;
mod timestamp;

pub use interval::Interval;
pub use models::{
    AssetType, CandleSeries, Metrics, NewsItem, Overview, Quote, SeriesStatus,
};
pub use range::RangeToken;
pub use symbol::Symbol;
pub use timestamp::UtcDateTime;
