//! Engine configuration: upstream endpoints, API keys, and the outbound
//! budget for the rate-capped provider.
//!
//! Keys are read from environment variables only and never logged. Each
//! provider checks a `MARKETMUX_`-prefixed variable first, then the plain
//! vendor variable.

use std::env;

const ALPHAVANTAGE_BASE_URL: &str = "https://www.alphavantage.co";
const FINNHUB_BASE_URL: &str = "https://finnhub.io/api/v1";
const BINANCE_REST_URL: &str = "https://api.binance.com";
const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/stream";

/// Finnhub's real budget is 60 calls/minute; the engine enforces 55.
const DEFAULT_FINNHUB_BUDGET: u32 = 55;

/// One upstream REST endpoint and its credential.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
}

/// The engine's full configuration surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub alphavantage: ProviderEndpoint,
    pub finnhub: ProviderEndpoint,
    pub binance_rest_url: String,
    pub binance_ws_url: String,
    /// Enforced outbound calls/minute for the Finnhub budget.
    pub finnhub_quota_per_minute: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alphavantage: ProviderEndpoint {
                base_url: String::from(ALPHAVANTAGE_BASE_URL),
                api_key: String::new(),
            },
            finnhub: ProviderEndpoint {
                base_url: String::from(FINNHUB_BASE_URL),
                api_key: String::new(),
            },
            binance_rest_url: String::from(BINANCE_REST_URL),
            binance_ws_url: String::from(BINANCE_WS_URL),
            finnhub_quota_per_minute: DEFAULT_FINNHUB_BUDGET,
        }
    }
}

impl EngineConfig {
    /// Resolve configuration from the environment.
    ///
    /// | Setting | Primary Env Var | Fallback Env Var |
    /// |---------|-----------------|------------------|
    /// | Alpha Vantage key | `MARKETMUX_ALPHAVANTAGE_API_KEY` | `ALPHAVANTAGE_API_KEY` |
    /// | Finnhub key | `MARKETMUX_FINNHUB_API_KEY` | `FINNHUB_API_KEY` |
    /// | Finnhub budget | `MARKETMUX_FINNHUB_BUDGET` | (55) |
    /// | Base/stream URLs | `MARKETMUX_<PROVIDER>_URL` | (vendor defaults) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            alphavantage: ProviderEndpoint {
                base_url: env_or("MARKETMUX_ALPHAVANTAGE_URL", &defaults.alphavantage.base_url),
                api_key: env_var("MARKETMUX_ALPHAVANTAGE_API_KEY")
                    .or_else(|| env_var("ALPHAVANTAGE_API_KEY"))
                    .unwrap_or_default(),
            },
            finnhub: ProviderEndpoint {
                base_url: env_or("MARKETMUX_FINNHUB_URL", &defaults.finnhub.base_url),
                api_key: env_var("MARKETMUX_FINNHUB_API_KEY")
                    .or_else(|| env_var("FINNHUB_API_KEY"))
                    .unwrap_or_default(),
            },
            binance_rest_url: env_or("MARKETMUX_BINANCE_URL", &defaults.binance_rest_url),
            binance_ws_url: env_or("MARKETMUX_BINANCE_WS_URL", &defaults.binance_ws_url),
            finnhub_quota_per_minute: env_var("MARKETMUX_FINNHUB_BUDGET")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.finnhub_quota_per_minute),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_var(name).unwrap_or_else(|| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enforce_the_reduced_finnhub_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.finnhub_quota_per_minute, 55);
        assert!(config.binance_ws_url.starts_with("wss://"));
    }
}
