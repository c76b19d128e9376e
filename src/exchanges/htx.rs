//! HTX connector.
//!
//! Runs in REST fallback mode: no websocket path, both feeds poll ticker
//! snapshots on the configured cadence, paced by the shared rate limiter.
//! Spot tickers come in one sweep; futures prices are probed per base
//! asset through the `_CQ` contract klines on the derivatives host.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::Settings;
use crate::exchanges::{
    json_f64, run_feed_loop, ConnectorCore, ConnectorStats, ExchangeConnector, PriceSink,
    SpotTicker,
};
use crate::models::{normalize_symbol, Exchange, Market, PriceUpdate};

/// Bases probed for futures prices; HTX has no all-contracts ticker sweep
/// on this API surface.
const POPULAR_BASES: [&str; 24] = [
    "BTC", "ETH", "BNB", "SOL", "XRP", "DOGE", "ADA", "AVAX", "MATIC", "DOT", "LINK", "UNI",
    "ATOM", "LTC", "BCH", "TRX", "ARB", "OP", "APT", "NEAR", "FTM", "INJ", "SUI", "SEI",
];

pub struct HtxConnector {
    core: ConnectorCore,
    check_interval: Duration,
}

impl HtxConnector {
    pub fn new(settings: &Settings, sink: PriceSink) -> Result<Self> {
        Ok(Self {
            core: ConnectorCore::new(Exchange::Htx, settings, sink)?,
            check_interval: settings.check_interval,
        })
    }

    /// `{"data": [{"symbol": "btcusdt", "close": ..., "vol": ...}]}`
    fn parse_spot_tickers(value: &serde_json::Value) -> HashMap<String, SpotTicker> {
        let mut prices = HashMap::new();
        let Some(items) = value.get("data").and_then(|d| d.as_array()) else {
            return prices;
        };
        for item in items {
            let Some(symbol) = item.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            let Some(close) = item.get("close").and_then(json_f64).filter(|p| *p > 0.0) else {
                continue;
            };
            // `vol` is the 24h quote turnover
            let volume_24h = item.get("vol").and_then(json_f64);
            prices.insert(
                normalize_symbol(symbol),
                SpotTicker {
                    price: close,
                    volume_24h,
                },
            );
        }
        prices
    }

    /// Canonical symbols of live contracts from `contract_contract_info`.
    fn parse_contract_symbols(value: &serde_json::Value) -> HashSet<String> {
        let mut symbols = HashSet::new();
        let Some(items) = value.get("data").and_then(|d| d.as_array()) else {
            return symbols;
        };
        for item in items {
            let status = item
                .get("contract_status")
                .and_then(|s| s.as_i64())
                .unwrap_or(0);
            let Some(base) = item.get("symbol").and_then(|s| s.as_str()) else {
                continue;
            };
            if status == 1 && !base.is_empty() {
                symbols.insert(format!("{}USDT", normalize_symbol(base)));
            }
        }
        symbols
    }

    /// Close of the latest 1-minute kline.
    fn parse_kline_close(value: &serde_json::Value) -> Option<f64> {
        value
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|items| items.first())
            .and_then(|item| item.get("close"))
            .and_then(json_f64)
            .filter(|p| *p > 0.0)
    }

    async fn fetch_symbols(&self) -> Result<()> {
        let url = format!("{}/market/tickers", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        let spot: HashSet<String> = Self::parse_spot_tickers(&value).into_keys().collect();

        let url = format!(
            "{}/api/v1/contract_contract_info",
            self.core.endpoints.futures_rest
        );
        let value = self.core.rest.get_json(&url).await?;
        let futures = Self::parse_contract_symbols(&value);

        *self.core.spot_symbols.write() = spot;
        *self.core.futures_symbols.write() = futures;

        info!(
            spot = self.core.spot_symbols.read().len(),
            futures = self.core.futures_symbols.read().len(),
            common = self.core.common_symbols().len(),
            "htx symbols fetched"
        );
        Ok(())
    }

    async fn fetch_contract_close(&self, base: &str) -> Result<Option<f64>> {
        let url = format!("{}/market/history/kline", self.core.endpoints.futures_rest);
        let contract = format!("{base}_CQ");
        let value = self
            .core
            .rest
            .get_json_with_query(
                &url,
                &[("symbol", contract.as_str()), ("period", "1min"), ("size", "1")],
            )
            .await?;
        Ok(Self::parse_kline_close(&value))
    }

    /// Spot polling loop: one full ticker sweep per cadence tick.
    async fn run_spot_poll(&self) -> Result<()> {
        while self.core.is_running() {
            let snapshot = self.snapshot_spot().await?;
            for (symbol, ticker) in snapshot {
                let mut update =
                    PriceUpdate::new(Exchange::Htx, Market::Spot, symbol, ticker.price);
                if let Some(volume) = ticker.volume_24h {
                    update = update.with_volume(volume);
                }
                self.core.emit(update);
            }
            self.core.metrics.touch();
            tokio::time::sleep(self.check_interval).await;
        }
        Ok(())
    }

    /// Futures polling loop: per-base `_CQ` probes, individual failures
    /// skipped so one dead contract cannot starve the sweep.
    async fn run_futures_poll(&self) -> Result<()> {
        while self.core.is_running() {
            let known = self.core.futures_symbols.read().clone();
            for base in POPULAR_BASES {
                if !self.core.is_running() {
                    break;
                }
                let symbol = format!("{base}USDT");
                if !known.contains(&symbol) {
                    continue;
                }
                match self.fetch_contract_close(base).await {
                    Ok(Some(price)) => {
                        self.core
                            .emit(PriceUpdate::new(Exchange::Htx, Market::Futures, symbol, price));
                    }
                    Ok(None) => {}
                    Err(e) => debug!(base, error = %e, "htx futures probe failed"),
                }
            }
            self.core.metrics.touch();
            tokio::time::sleep(self.check_interval).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for HtxConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Htx
    }

    async fn initialize(&self) -> Result<()> {
        self.fetch_symbols().await
    }

    async fn start_feeds(self: Arc<Self>) -> Result<()> {
        self.core.start_running();

        let conn = self.clone();
        self.core.track_task(tokio::spawn(async move {
            let running = conn.core.running.clone();
            let metrics = conn.core.metrics.clone();
            let delay = conn.core.reconnect_delay;
            let c = conn.clone();
            run_feed_loop(Exchange::Htx, "spot", running, delay, metrics, move || {
                let c = c.clone();
                async move { c.run_spot_poll().await }
            })
            .await;
        }));

        let conn = self.clone();
        self.core.track_task(tokio::spawn(async move {
            let running = conn.core.running.clone();
            let metrics = conn.core.metrics.clone();
            let delay = conn.core.reconnect_delay;
            let c = conn.clone();
            run_feed_loop(Exchange::Htx, "futures", running, delay, metrics, move || {
                let c = c.clone();
                async move { c.run_futures_poll().await }
            })
            .await;
        }));

        Ok(())
    }

    async fn close(&self) {
        self.core.shutdown();
    }

    async fn snapshot_spot(&self) -> Result<HashMap<String, SpotTicker>> {
        let url = format!("{}/market/tickers", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        Ok(Self::parse_spot_tickers(&value))
    }

    async fn snapshot_futures(&self) -> Result<HashMap<String, f64>> {
        let known = self.core.futures_symbols.read().clone();
        let mut prices = HashMap::new();
        for base in POPULAR_BASES {
            let symbol = format!("{base}USDT");
            if !known.is_empty() && !known.contains(&symbol) {
                continue;
            }
            match self.fetch_contract_close(base).await {
                Ok(Some(price)) => {
                    prices.insert(symbol, price);
                }
                Ok(None) => {}
                Err(e) => debug!(base, error = %e, "htx futures snapshot probe failed"),
            }
        }
        Ok(prices)
    }

    async fn spot_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/market/detail/merged", self.core.endpoints.spot_rest);
        let venue = symbol.to_ascii_lowercase();
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("symbol", venue.as_str())])
            .await
            .context("htx: merged detail request failed")?;
        let price = value
            .get("tick")
            .and_then(|t| t.get("close"))
            .and_then(json_f64);
        Ok(price.filter(|p| *p > 0.0))
    }

    async fn futures_price(&self, symbol: &str) -> Result<Option<f64>> {
        let base = symbol.strip_suffix("USDT").unwrap_or(symbol);
        self.fetch_contract_close(base).await
    }

    fn common_symbols(&self) -> HashSet<String> {
        self.core.common_symbols()
    }

    fn stats(&self) -> ConnectorStats {
        self.core.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_spot_tickers_normalizes_and_keeps_volume() {
        let value = json!({
            "status": "ok",
            "data": [
                { "symbol": "btcusdt", "close": 30123.4, "vol": 98765432.1 },
                { "symbol": "ethusdt", "close": 2050.25, "vol": 1234.5 },
                { "symbol": "deadusdt", "close": 0.0, "vol": 10.0 }
            ]
        });

        let prices = HtxConnector::parse_spot_tickers(&value);
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["BTCUSDT"].price, 30123.4);
        assert_eq!(prices["BTCUSDT"].volume_24h, Some(98765432.1));
        assert_eq!(prices["ETHUSDT"].price, 2050.25);
    }

    #[test]
    fn test_parse_spot_tickers_handles_missing_data() {
        let value = json!({ "status": "error" });
        assert!(HtxConnector::parse_spot_tickers(&value).is_empty());
    }

    #[test]
    fn test_parse_contract_symbols_filters_status() {
        let value = json!({
            "data": [
                { "symbol": "BTC", "contract_status": 1, "contract_type": "quarter" },
                { "symbol": "ETH", "contract_status": 1 },
                { "symbol": "DOGE", "contract_status": 0 }
            ]
        });

        let symbols = HtxConnector::parse_contract_symbols(&value);
        assert!(symbols.contains("BTCUSDT"));
        assert!(symbols.contains("ETHUSDT"));
        assert!(!symbols.contains("DOGEUSDT"));
    }

    #[test]
    fn test_parse_kline_close() {
        let value = json!({
            "status": "ok",
            "data": [ { "close": 30555.5, "open": 30500.0 } ]
        });
        assert_eq!(HtxConnector::parse_kline_close(&value), Some(30555.5));

        let empty = json!({ "status": "ok", "data": [] });
        assert_eq!(HtxConnector::parse_kline_close(&empty), None);
    }
}
