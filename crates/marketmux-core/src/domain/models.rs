use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ProviderId, Symbol, ValidationError};

/// Asset class served by the aggregation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Stock,
    Crypto,
}

impl AssetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "STOCK",
            Self::Crypto => "CRYPTO",
        }
    }
}

impl Display for AssetType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "STOCK" => Ok(Self::Stock),
            "CRYPTO" => Ok(Self::Crypto),
            other => Err(ValidationError::InvalidAssetType {
                value: other.to_owned(),
            }),
        }
    }
}

/// Canonical quote emitted by every quote path regardless of origin.
///
/// `timestamp` is epoch milliseconds; adapters convert vendor units before
/// constructing a quote so the unit is uniform at the router boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: Symbol,
    pub asset_type: AssetType,
    pub price: f64,
    pub change_abs: f64,
    pub change_pct: f64,
    pub timestamp: i64,
    pub source: ProviderId,
    pub is_stale: bool,
}

impl Quote {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        asset_type: AssetType,
        price: f64,
        change_abs: f64,
        change_pct: f64,
        timestamp: i64,
        source: ProviderId,
    ) -> Result<Self, ValidationError> {
        validate_finite("price", price)?;
        validate_finite("change_abs", change_abs)?;
        validate_finite("change_pct", change_pct)?;
        if price < 0.0 {
            return Err(ValidationError::NegativeValue { field: "price" });
        }

        Ok(Self {
            symbol,
            asset_type,
            price,
            change_abs,
            change_pct,
            timestamp,
            source,
            is_stale: false,
        })
    }

    /// Mark this quote as served past its TTL.
    pub fn into_stale(mut self) -> Self {
        self.is_stale = true;
        self
    }
}

/// Status tag carried by every candle series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesStatus {
    Ok,
    Error,
}

/// Canonical candle series: parallel time-ascending arrays of equal length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    pub status: SeriesStatus,
    /// Bar open times, epoch milliseconds, ascending.
    pub time: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
    /// Tag identifying who produced the series (a provider id or `history`).
    pub source: String,
}

impl CandleSeries {
    pub fn new(
        time: Vec<i64>,
        open: Vec<f64>,
        high: Vec<f64>,
        low: Vec<f64>,
        close: Vec<f64>,
        volume: Vec<f64>,
        source: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let len = time.len();
        if [open.len(), high.len(), low.len(), close.len(), volume.len()]
            .iter()
            .any(|&other| other != len)
        {
            return Err(ValidationError::SeriesLengthMismatch);
        }

        if time.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(ValidationError::SeriesTimeNotAscending);
        }

        Ok(Self {
            status: SeriesStatus::Ok,
            time,
            open,
            high,
            low,
            close,
            volume,
            source: source.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// One news article for an equity, trailing-window scoped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    /// Publication time, epoch milliseconds.
    pub datetime: i64,
    pub headline: String,
    pub source: String,
    pub summary: String,
    pub url: String,
}

/// Opaque fundamentals mapping for an equity (absent for crypto).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub source: ProviderId,
    pub fields: Map<String, Value>,
}

/// Opaque key-metric mapping for an equity (absent for crypto).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub source: ProviderId,
    pub fields: Map<String, Value>,
}

fn validate_finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFiniteValue { field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(value: &str) -> Symbol {
        Symbol::parse(value).expect("valid symbol")
    }

    #[test]
    fn quote_rejects_non_finite_price() {
        let err = Quote::new(
            symbol("AAPL"),
            AssetType::Stock,
            f64::NAN,
            0.0,
            0.0,
            0,
            ProviderId::Alphavantage,
        )
        .expect_err("must fail");
        assert!(matches!(err, ValidationError::NonFiniteValue { .. }));
    }

    #[test]
    fn quote_rejects_negative_price() {
        let err = Quote::new(
            symbol("AAPL"),
            AssetType::Stock,
            -1.0,
            0.0,
            0.0,
            0,
            ProviderId::Alphavantage,
        )
        .expect_err("must fail");
        assert!(matches!(err, ValidationError::NegativeValue { .. }));
    }

    #[test]
    fn series_rejects_length_mismatch() {
        let err = CandleSeries::new(
            vec![1, 2],
            vec![1.0],
            vec![1.0, 2.0],
            vec![1.0, 2.0],
            vec![1.0, 2.0],
            vec![0.0, 0.0],
            "binance",
        )
        .expect_err("must fail");
        assert!(matches!(err, ValidationError::SeriesLengthMismatch));
    }

    #[test]
    fn series_rejects_descending_time() {
        let err = CandleSeries::new(
            vec![2, 1],
            vec![1.0, 2.0],
            vec![1.0, 2.0],
            vec![1.0, 2.0],
            vec![1.0, 2.0],
            vec![0.0, 0.0],
            "binance",
        )
        .expect_err("must fail");
        assert!(matches!(err, ValidationError::SeriesTimeNotAscending));
    }

    #[test]
    fn asset_type_round_trips() {
        assert_eq!("crypto".parse::<AssetType>().expect("parses"), AssetType::Crypto);
        assert_eq!(AssetType::Stock.as_str(), "STOCK");
    }
}
