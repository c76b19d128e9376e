use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Mexc,
    GateIo,
    BingX,
    Htx,
}

impl Exchange {
    pub const ALL: [Exchange; 4] = [
        Exchange::Mexc,
        Exchange::GateIo,
        Exchange::BingX,
        Exchange::Htx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Mexc => "mexc",
            Exchange::GateIo => "gateio",
            Exchange::BingX => "bingx",
            Exchange::Htx => "htx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mexc" => Ok(Exchange::Mexc),
            "gateio" | "gate" => Ok(Exchange::GateIo),
            "bingx" => Ok(Exchange::BingX),
            "htx" | "huobi" => Ok(Exchange::Htx),
            other => Err(anyhow::anyhow!("unknown exchange: {other}")),
        }
    }
}

/// Market types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Futures,
}

impl Market {
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Futures => "futures",
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a venue symbol to canonical form: uppercase, no separators
/// (BTC_USDT, btc-usdt -> BTCUSDT). Idempotent on already-canonical input.
pub fn normalize_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Extract the base asset from a canonical symbol (BTCUSDT -> BTC).
pub fn base_asset(symbol: &str) -> String {
    symbol
        .strip_suffix("_USDT")
        .or_else(|| symbol.strip_suffix("USDT"))
        .unwrap_or(symbol)
        .to_string()
}

/// Real-time price update emitted by an exchange connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub exchange: Exchange,
    pub market: Market,
    pub symbol: String,
    pub price: f64,
    pub volume_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: Option<f64>,
}

impl PriceUpdate {
    pub fn new(exchange: Exchange, market: Market, symbol: impl Into<String>, price: f64) -> Self {
        Self {
            exchange,
            market,
            symbol: symbol.into(),
            price,
            volume_24h: None,
            timestamp: Utc::now(),
            latency_ms: None,
        }
    }

    pub fn with_volume(mut self, volume_24h: f64) -> Self {
        self.volume_24h = Some(volume_24h);
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Cache key: `exchange:market:symbol`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.exchange, self.market, self.symbol)
    }
}

/// Cross-exchange spot/futures arbitrage opportunity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadOpportunity {
    pub symbol: String,
    pub base_asset: String,
    pub spot_exchange: Exchange,
    pub spot_price: f64,
    pub futures_exchange: Exchange,
    pub futures_price: f64,
    pub spread_percent: f64,
    pub timestamp: DateTime<Utc>,
    pub detection_latency_ms: Option<f64>,
    pub volume_24h: Option<f64>,
}

impl SpreadOpportunity {
    pub fn absolute_spread(&self) -> f64 {
        (self.futures_price - self.spot_price).abs()
    }

    /// Web link to the spot market, used by the chat layer.
    pub fn spot_url(&self) -> String {
        match self.spot_exchange {
            Exchange::Mexc => format!("https://www.mexc.com/exchange/{}", self.symbol),
            Exchange::GateIo => format!("https://www.gate.io/trade/{}", self.symbol),
            Exchange::BingX => format!("https://www.bingx.com/en-us/spot/{}", self.symbol),
            Exchange::Htx => format!(
                "https://www.htx.com/exchange/{}",
                self.symbol.to_ascii_lowercase()
            ),
        }
    }

    /// Web link to the futures market.
    pub fn futures_url(&self) -> String {
        match self.futures_exchange {
            Exchange::Mexc => format!("https://www.mexc.com/futures/{}", self.symbol),
            Exchange::GateIo => format!("https://www.gate.io/futures_trade/{}", self.symbol),
            Exchange::BingX => format!("https://www.bingx.com/en-us/futures/{}", self.symbol),
            Exchange::Htx => format!(
                "https://www.htx.com/futures/{}",
                self.symbol.to_ascii_lowercase()
            ),
        }
    }
}

/// Alert dispatched to the notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadAlert {
    pub opportunity: SpreadOpportunity,
}

impl SpreadAlert {
    pub fn new(opportunity: SpreadOpportunity) -> Self {
        Self { opportunity }
    }
}

/// Per-subscriber alert filters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFilters {
    pub min_spread: f64,
    pub max_spread: f64,
    pub min_volume_usd: f64,
    pub enabled_exchanges: HashSet<Exchange>,
}

impl Default for UserFilters {
    fn default() -> Self {
        Self {
            min_spread: 3.0,
            max_spread: 50.0,
            min_volume_usd: 0.0,
            enabled_exchanges: Exchange::ALL.into_iter().collect(),
        }
    }
}

impl UserFilters {
    /// Acceptance test: spread bounds, volume floor (unknown volume passes),
    /// and both legs on enabled exchanges.
    pub fn accepts(&self, opp: &SpreadOpportunity) -> bool {
        if opp.spread_percent < self.min_spread || opp.spread_percent > self.max_spread {
            return false;
        }
        if let Some(volume) = opp.volume_24h {
            if volume < self.min_volume_usd {
                return false;
            }
        }
        self.enabled_exchanges.contains(&opp.spot_exchange)
            && self.enabled_exchanges.contains(&opp.futures_exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opportunity(spread: f64, volume: Option<f64>) -> SpreadOpportunity {
        SpreadOpportunity {
            symbol: "BTCUSDT".to_string(),
            base_asset: "BTC".to_string(),
            spot_exchange: Exchange::Mexc,
            spot_price: 30000.0,
            futures_exchange: Exchange::GateIo,
            futures_price: 30000.0 * (1.0 + spread / 100.0),
            spread_percent: spread,
            timestamp: Utc::now(),
            detection_latency_ms: None,
            volume_24h: volume,
        }
    }

    #[test]
    fn test_normalize_symbol_strips_separators_and_case() {
        assert_eq!(normalize_symbol("BTC_USDT"), "BTCUSDT");
        assert_eq!(normalize_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(normalize_symbol("ethusdt"), "ETHUSDT");
    }

    #[test]
    fn test_normalize_symbol_idempotent_on_canonical() {
        let canonical = normalize_symbol("SOL_USDT");
        assert_eq!(normalize_symbol(&canonical), canonical);
    }

    #[test]
    fn test_base_asset_strips_quote() {
        assert_eq!(base_asset("BTCUSDT"), "BTC");
        assert_eq!(base_asset("SOL_USDT"), "SOL");
        assert_eq!(base_asset("WETH"), "WETH");
    }

    #[test]
    fn test_price_update_key() {
        let update = PriceUpdate::new(Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0);
        assert_eq!(update.key(), "mexc:spot:BTCUSDT");
    }

    #[test]
    fn test_exchange_round_trip() {
        for exchange in Exchange::ALL {
            assert_eq!(exchange.as_str().parse::<Exchange>().unwrap(), exchange);
        }
    }

    #[test]
    fn test_filters_default_accepts_threshold_spread() {
        let filters = UserFilters::default();
        assert!(filters.accepts(&opportunity(4.0, Some(1_000_000.0))));
        assert!(filters.accepts(&opportunity(3.0, None)));
    }

    #[test]
    fn test_filters_reject_out_of_range_spread() {
        let filters = UserFilters::default();
        assert!(!filters.accepts(&opportunity(1.0, None)));
        assert!(!filters.accepts(&opportunity(60.0, None)));
    }

    #[test]
    fn test_filters_volume_floor() {
        let filters = UserFilters {
            min_volume_usd: 100_000.0,
            ..Default::default()
        };
        assert!(!filters.accepts(&opportunity(5.0, Some(50_000.0))));
        assert!(filters.accepts(&opportunity(5.0, Some(150_000.0))));
        // Unknown volume is allowed through
        assert!(filters.accepts(&opportunity(5.0, None)));
    }

    #[test]
    fn test_filters_empty_exchange_set_rejects_everything() {
        let filters = UserFilters {
            enabled_exchanges: HashSet::new(),
            ..Default::default()
        };
        assert!(!filters.accepts(&opportunity(5.0, Some(1_000_000.0))));
    }

    #[test]
    fn test_filters_require_both_legs_enabled() {
        let filters = UserFilters {
            enabled_exchanges: [Exchange::Mexc].into_iter().collect(),
            ..Default::default()
        };
        // Spot leg on mexc, futures leg on gateio: rejected
        assert!(!filters.accepts(&opportunity(5.0, None)));
    }
}
