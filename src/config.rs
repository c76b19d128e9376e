//! Runtime configuration.
//!
//! All settings come from the environment (with `.env` support) and carry
//! sane defaults; the binary may override a few of them from CLI flags.

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::Exchange;

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Optional read-only API credentials for one venue.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
}

impl ApiCredentials {
    fn from_env(key_var: &str, secret_var: &str) -> Option<Self> {
        match (env::var(key_var), env::var(secret_var)) {
            (Ok(key), Ok(secret)) if !key.is_empty() => Some(Self { key, secret }),
            _ => None,
        }
    }
}

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Minimum spread percentage that triggers an alert.
    pub spread_threshold: f64,
    /// Cadence of the opportunity scan loop.
    pub scan_interval: Duration,
    /// Cooldown between alerts for the same base asset.
    pub notification_cooldown: Duration,
    /// TTL for cached prices.
    pub cache_ttl: Duration,
    /// REST fallback polling cadence.
    pub check_interval: Duration,
    /// Delay before a feed loop reconnects after an error.
    pub ws_reconnect_delay: Duration,
    /// Exchanges the engine should run connectors for.
    pub enabled_exchanges: HashSet<Exchange>,
    pub mexc_credentials: Option<ApiCredentials>,
    pub gateio_credentials: Option<ApiCredentials>,
    pub bingx_credentials: Option<ApiCredentials>,
    pub htx_credentials: Option<ApiCredentials>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            spread_threshold: 3.0,
            scan_interval: Duration::from_secs(1),
            notification_cooldown: Duration::from_secs(1800),
            cache_ttl: Duration::from_secs(300),
            check_interval: Duration::from_millis(500),
            ws_reconnect_delay: Duration::from_secs(5),
            enabled_exchanges: Exchange::ALL.into_iter().collect(),
            mexc_credentials: None,
            gateio_credentials: None,
            bingx_credentials: None,
            htx_credentials: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let enabled_exchanges = env::var("ENABLED_EXCHANGES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| Exchange::from_str(s).ok())
                    .collect::<HashSet<_>>()
            })
            .filter(|set| !set.is_empty())
            .unwrap_or_else(|| Exchange::ALL.into_iter().collect());

        Self {
            spread_threshold: env_parse("SPREAD_THRESHOLD", 3.0),
            scan_interval: Duration::from_secs(env_parse("SCAN_INTERVAL_SECS", 1u64)),
            notification_cooldown: Duration::from_secs(env_parse(
                "NOTIFICATION_COOLDOWN_SEC",
                1800u64,
            )),
            cache_ttl: Duration::from_secs(env_parse("CACHE_TTL_SECS", 300u64)),
            check_interval: Duration::from_millis(env_parse("CHECK_INTERVAL_MS", 500u64)),
            ws_reconnect_delay: Duration::from_secs(env_parse("WS_RECONNECT_DELAY", 5u64)),
            enabled_exchanges,
            mexc_credentials: ApiCredentials::from_env("MEXC_API_KEY", "MEXC_API_SECRET"),
            gateio_credentials: ApiCredentials::from_env("GATEIO_API_KEY", "GATEIO_API_SECRET"),
            bingx_credentials: ApiCredentials::from_env("BINGX_API_KEY", "BINGX_API_SECRET"),
            htx_credentials: ApiCredentials::from_env("HTX_API_KEY", "HTX_API_SECRET"),
        }
    }

    pub fn credentials_for(&self, exchange: Exchange) -> Option<&ApiCredentials> {
        match exchange {
            Exchange::Mexc => self.mexc_credentials.as_ref(),
            Exchange::GateIo => self.gateio_credentials.as_ref(),
            Exchange::BingX => self.bingx_credentials.as_ref(),
            Exchange::Htx => self.htx_credentials.as_ref(),
        }
    }
}

/// Base URLs for one venue's REST and WebSocket APIs.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    pub spot_rest: &'static str,
    pub spot_ws: &'static str,
    pub futures_rest: &'static str,
    pub futures_ws: &'static str,
}

pub fn endpoints(exchange: Exchange) -> Endpoints {
    match exchange {
        Exchange::Mexc => Endpoints {
            spot_rest: "https://api.mexc.com",
            spot_ws: "wss://wbs.mexc.com/raw/ws",
            futures_rest: "https://contract.mexc.com",
            futures_ws: "wss://contract.mexc.com/edge/ws",
        },
        Exchange::GateIo => Endpoints {
            spot_rest: "https://api.gateio.ws/api/v4",
            spot_ws: "wss://api.gateio.ws/ws/v4/",
            futures_rest: "https://api.gateio.ws/api/v4",
            futures_ws: "wss://api.gateio.ws/ws/v4/",
        },
        Exchange::BingX => Endpoints {
            spot_rest: "https://open-api.bingx.com",
            spot_ws: "wss://open-api-ws.bingx.com/spot/ws",
            futures_rest: "https://open-api.bingx.com",
            futures_ws: "wss://open-api-ws.bingx.com/swap/ws",
        },
        Exchange::Htx => Endpoints {
            spot_rest: "https://api.htx.com",
            spot_ws: "wss://api.htx.com/ws",
            futures_rest: "https://api.hbdm.com",
            futures_ws: "wss://api.hbdm.com/ws",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.spread_threshold, 3.0);
        assert_eq!(settings.scan_interval, Duration::from_secs(1));
        assert_eq!(settings.notification_cooldown, Duration::from_secs(1800));
        assert_eq!(settings.cache_ttl, Duration::from_secs(300));
        assert_eq!(settings.enabled_exchanges.len(), 4);
    }

    #[test]
    fn test_every_exchange_has_endpoints() {
        for exchange in Exchange::ALL {
            let ep = endpoints(exchange);
            assert!(ep.spot_rest.starts_with("https://"));
            assert!(ep.spot_ws.starts_with("wss://"));
            assert!(ep.futures_rest.starts_with("https://"));
            assert!(ep.futures_ws.starts_with("wss://"));
        }
    }
}
