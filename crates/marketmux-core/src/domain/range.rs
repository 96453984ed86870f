use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::Interval;

/// Logical candle range token accepted by the aggregation API.
///
/// Unrecognized tokens deliberately degrade to [`RangeToken::SixMonths`]
/// instead of erroring, so a mistyped range still renders a chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeToken {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
    #[serde(rename = "3m")]
    ThreeMonths,
    #[serde(rename = "6m")]
    SixMonths,
    #[serde(rename = "1y")]
    OneYear,
}

impl RangeToken {
    pub const ALL: [Self; 6] = [
        Self::OneDay,
        Self::OneWeek,
        Self::OneMonth,
        Self::ThreeMonths,
        Self::SixMonths,
        Self::OneYear,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::OneWeek => "1w",
            Self::OneMonth => "1m",
            Self::ThreeMonths => "3m",
            Self::SixMonths => "6m",
            Self::OneYear => "1y",
        }
    }

    /// Parse a token, falling back to the `6m` mapping for anything
    /// unrecognized.
    pub fn parse_lossy(input: &str) -> Self {
        match input.trim().to_ascii_lowercase().as_str() {
            "1d" => Self::OneDay,
            "1w" => Self::OneWeek,
            "1m" => Self::OneMonth,
            "3m" => Self::ThreeMonths,
            "6m" => Self::SixMonths,
            "1y" => Self::OneYear,
            _ => Self::SixMonths,
        }
    }

    /// Whether this token resolves to intraday bars.
    pub const fn is_intraday(self) -> bool {
        matches!(self, Self::OneDay | Self::OneWeek)
    }

    /// Fixed crypto-venue interval and bar-count pair for this token.
    pub const fn crypto_plan(self) -> (Interval, usize) {
        match self {
            Self::OneDay => (Interval::OneHour, 24),
            Self::OneWeek => (Interval::OneHour, 168),
            Self::OneMonth => (Interval::OneDay, 30),
            Self::ThreeMonths => (Interval::OneDay, 90),
            Self::SixMonths => (Interval::OneDay, 180),
            Self::OneYear => (Interval::OneDay, 365),
        }
    }

    /// Interval and bar count requested from the primary equities provider.
    pub const fn equity_plan(self) -> (Interval, usize) {
        match self {
            Self::OneDay => (Interval::OneHour, 24),
            Self::OneWeek => (Interval::OneHour, 168),
            Self::OneMonth => (Interval::OneDay, 30),
            Self::ThreeMonths => (Interval::OneDay, 90),
            Self::SixMonths => (Interval::OneDay, 180),
            Self::OneYear => (Interval::OneDay, 365),
        }
    }

    /// Trailing calendar window used when the secondary equities provider is
    /// retried with an explicit from/to range: intraday tokens request 7
    /// days of hourly bars, longer tokens request 30/180/365 days of daily
    /// bars.
    pub const fn fallback_window(self) -> (Interval, i64) {
        match self {
            Self::OneDay | Self::OneWeek => (Interval::OneHour, 7),
            Self::OneMonth => (Interval::OneDay, 30),
            Self::ThreeMonths | Self::SixMonths => (Interval::OneDay, 180),
            Self::OneYear => (Interval::OneDay, 365),
        }
    }
}

impl Display for RangeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_token_maps_to_six_months() {
        assert_eq!(RangeToken::parse_lossy("2y"), RangeToken::SixMonths);
        assert_eq!(RangeToken::parse_lossy(""), RangeToken::SixMonths);
        assert_eq!(
            RangeToken::parse_lossy("bogus").crypto_plan(),
            RangeToken::SixMonths.crypto_plan()
        );
    }

    #[test]
    fn one_week_crypto_plan_is_hourly_168() {
        assert_eq!(
            RangeToken::OneWeek.crypto_plan(),
            (Interval::OneHour, 168)
        );
    }

    #[test]
    fn parse_lossy_is_case_insensitive() {
        assert_eq!(RangeToken::parse_lossy(" 1Y "), RangeToken::OneYear);
    }

    #[test]
    fn intraday_tokens_fall_back_to_week_of_hourly_bars() {
        assert_eq!(RangeToken::OneDay.fallback_window(), (Interval::OneHour, 7));
        assert_eq!(RangeToken::OneWeek.fallback_window(), (Interval::OneHour, 7));
        assert_eq!(RangeToken::OneYear.fallback_window(), (Interval::OneDay, 365));
    }
}
