use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Canonical provider identifiers used in source tags and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Alphavantage,
    Finnhub,
    Binance,
}

impl ProviderId {
    pub const ALL: [Self; 3] = [Self::Alphavantage, Self::Finnhub, Self::Binance];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alphavantage => "alphavantage",
            Self::Finnhub => "finnhub",
            Self::Binance => "binance",
        }
    }

    /// Short tag used in colon-delimited cache keys (`quote:av:AAPL`).
    pub const fn cache_tag(self) -> &'static str {
        match self {
            Self::Alphavantage => "av",
            Self::Finnhub => "finnhub",
            Self::Binance => "binance",
        }
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "alphavantage" | "av" => Ok(Self::Alphavantage),
            "finnhub" => Ok(Self::Finnhub),
            "binance" => Ok(Self::Binance),
            other => Err(ValidationError::InvalidProvider {
                value: other.to_owned(),
            }),
        }
    }
}
