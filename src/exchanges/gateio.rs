//! Gate.io connector.
//!
//! Both markets share one websocket host with channel-based subscriptions
//! (`spot.tickers` / `futures.tickers`). Venue names carry underscores
//! (`BTC_USDT`); the futures channel payload additionally prefixes the
//! settle currency (`USDT_BTC_USDT`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::Settings;
use crate::exchanges::{
    json_f64, run_feed_loop, ws_connect, ConnectorCore, ConnectorStats, ExchangeConnector,
    PriceSink, SpotTicker, SUBSCRIBE_DELAY,
};
use crate::models::{normalize_symbol, Exchange, Market, PriceUpdate};

#[derive(Debug, Deserialize)]
struct CurrencyPair {
    #[serde(default)]
    id: String,
    #[serde(default)]
    trade_status: String,
}

#[derive(Debug, Deserialize)]
struct FuturesContract {
    #[serde(default)]
    name: String,
    #[serde(default)]
    in_delisting: bool,
}

#[derive(Debug, Deserialize)]
struct SpotTickerEntry {
    #[serde(default)]
    currency_pair: String,
    #[serde(default)]
    last: String,
    #[serde(default)]
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct FuturesTickerEntry {
    #[serde(default)]
    contract: String,
    #[serde(default)]
    last: serde_json::Value,
}

/// Channel push: `{"channel": "spot.tickers", "event": "update", "result": {...}}`
#[derive(Debug, Deserialize)]
struct ChannelMsg {
    #[serde(default)]
    channel: String,
    result: Option<serde_json::Value>,
}

pub struct GateIoConnector {
    core: ConnectorCore,
    /// canonical symbol -> venue pair/contract name (`BTCUSDT` -> `BTC_USDT`)
    venue_names: RwLock<HashMap<String, String>>,
}

impl GateIoConnector {
    pub fn new(settings: &Settings, sink: PriceSink) -> Result<Self> {
        Ok(Self {
            core: ConnectorCore::new(Exchange::GateIo, settings, sink)?,
            venue_names: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_symbols(&self) -> Result<()> {
        let url = format!("{}/spot/currency_pairs", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        let pairs: Vec<CurrencyPair> =
            serde_json::from_value(value).context("gateio: bad currency_pairs payload")?;

        let mut spot = HashSet::new();
        let mut venue_names = HashMap::new();
        for pair in pairs {
            if pair.trade_status != "tradable" || pair.id.is_empty() {
                continue;
            }
            let canonical = normalize_symbol(&pair.id);
            venue_names.insert(canonical.clone(), pair.id);
            spot.insert(canonical);
        }

        let url = format!("{}/futures/usdt/contracts", self.core.endpoints.futures_rest);
        let value = self.core.rest.get_json(&url).await?;
        let contracts: Vec<FuturesContract> =
            serde_json::from_value(value).context("gateio: bad contracts payload")?;

        let mut futures = HashSet::new();
        for contract in contracts {
            if contract.in_delisting || contract.name.is_empty() {
                continue;
            }
            let canonical = normalize_symbol(&contract.name);
            venue_names.entry(canonical.clone()).or_insert(contract.name);
            futures.insert(canonical);
        }

        *self.core.spot_symbols.write() = spot;
        *self.core.futures_symbols.write() = futures;
        *self.venue_names.write() = venue_names;

        info!(
            spot = self.core.spot_symbols.read().len(),
            futures = self.core.futures_symbols.read().len(),
            common = self.core.common_symbols().len(),
            "gateio symbols fetched"
        );
        Ok(())
    }

    /// Venue pair name for a canonical symbol (`BTCUSDT` -> `BTC_USDT`).
    fn venue_name(&self, symbol: &str) -> String {
        if let Some(name) = self.venue_names.read().get(symbol) {
            return name.clone();
        }
        if symbol.len() > 4 && symbol.ends_with("USDT") {
            format!("{}_{}", &symbol[..symbol.len() - 4], "USDT")
        } else {
            symbol.to_string()
        }
    }

    fn parse_spot_message(
        text: &str,
        known: &HashSet<String>,
    ) -> serde_json::Result<Option<PriceUpdate>> {
        let msg: ChannelMsg = serde_json::from_str(text)?;
        if msg.channel != "spot.tickers" {
            return Ok(None);
        }
        let Some(result) = msg.result else {
            return Ok(None);
        };

        let Some(pair) = result.get("currency_pair").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let symbol = normalize_symbol(pair);
        if !known.contains(&symbol) {
            return Ok(None);
        }

        let Some(price) = result.get("last").and_then(json_f64).filter(|p| *p > 0.0) else {
            return Ok(None);
        };

        let mut update = PriceUpdate::new(Exchange::GateIo, Market::Spot, symbol, price);
        if let Some(volume) = result.get("quote_volume").and_then(json_f64) {
            update = update.with_volume(volume);
        }
        Ok(Some(update))
    }

    fn parse_futures_message(
        text: &str,
        known: &HashSet<String>,
    ) -> serde_json::Result<Option<PriceUpdate>> {
        let msg: ChannelMsg = serde_json::from_str(text)?;
        if msg.channel != "futures.tickers" {
            return Ok(None);
        }
        let Some(result) = msg.result else {
            return Ok(None);
        };

        let Some(contract) = result.get("contract").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        // Settle-prefixed contract form: USDT_BTC_USDT -> BTCUSDT
        let symbol = normalize_symbol(contract.strip_prefix("USDT_").unwrap_or(contract));
        if !known.contains(&symbol) {
            return Ok(None);
        }

        let Some(price) = result.get("last").and_then(json_f64).filter(|p| *p > 0.0) else {
            return Ok(None);
        };

        Ok(Some(PriceUpdate::new(
            Exchange::GateIo,
            Market::Futures,
            symbol,
            price,
        )))
    }

    async fn run_ws(&self, market: Market) -> Result<()> {
        let (url, channel) = match market {
            Market::Spot => (self.core.endpoints.spot_ws, "spot.tickers"),
            Market::Futures => (self.core.endpoints.futures_ws, "futures.tickers"),
        };

        let stream = ws_connect(url).await?;
        let (mut write, mut read) = stream.split();

        let symbols = self.core.subscription_symbols();
        for symbol in &symbols {
            let payload = match market {
                Market::Spot => self.venue_name(symbol),
                Market::Futures => format!("USDT_{}", self.venue_name(symbol)),
            };
            let subscribe = serde_json::json!({
                "time": Utc::now().timestamp(),
                "channel": channel,
                "event": "subscribe",
                "payload": [payload],
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .context("gateio: subscribe failed")?;
            tokio::time::sleep(SUBSCRIBE_DELAY).await;
        }
        info!(
            market = %market,
            subscriptions = symbols.len(),
            "gateio websocket subscribed"
        );

        let known = match market {
            Market::Spot => self.core.spot_symbols.read().clone(),
            Market::Futures => self.core.futures_symbols.read().clone(),
        };

        while let Some(message) = read.next().await {
            if !self.core.is_running() {
                break;
            }
            match message {
                Ok(Message::Text(text)) => {
                    let received = Instant::now();
                    self.core.metrics.record_ws_message();
                    let parsed = match market {
                        Market::Spot => Self::parse_spot_message(&text, &known),
                        Market::Futures => Self::parse_futures_message(&text, &known),
                    };
                    match parsed {
                        Ok(Some(update)) => {
                            let latency_ms = received.elapsed().as_secs_f64() * 1000.0;
                            self.core.emit(update.with_latency(latency_ms));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.core.metrics.inc_errors();
                            debug!(market = %market, error = %e, "gateio frame parse error");
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    write.send(Message::Pong(payload)).await.ok();
                }
                Ok(Message::Close(frame)) => {
                    info!(market = %market, ?frame, "gateio websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("gateio: websocket read error"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for GateIoConnector {
    fn exchange(&self) -> Exchange {
        Exchange::GateIo
    }

    async fn initialize(&self) -> Result<()> {
        self.fetch_symbols().await
    }

    async fn start_feeds(self: Arc<Self>) -> Result<()> {
        self.core.start_running();

        for market in [Market::Spot, Market::Futures] {
            let conn = self.clone();
            self.core.track_task(tokio::spawn(async move {
                let running = conn.core.running.clone();
                let metrics = conn.core.metrics.clone();
                let delay = conn.core.reconnect_delay;
                let label = market.as_str();
                let c = conn.clone();
                run_feed_loop(Exchange::GateIo, label, running, delay, metrics, move || {
                    let c = c.clone();
                    async move { c.run_ws(market).await }
                })
                .await;
            }));
        }

        Ok(())
    }

    async fn close(&self) {
        self.core.shutdown();
    }

    async fn snapshot_spot(&self) -> Result<HashMap<String, SpotTicker>> {
        let url = format!("{}/spot/tickers", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        let tickers: Vec<SpotTickerEntry> =
            serde_json::from_value(value).context("gateio: bad spot tickers payload")?;

        let mut prices = HashMap::new();
        for ticker in tickers {
            let Ok(price) = ticker.last.parse::<f64>() else {
                continue;
            };
            if price <= 0.0 || ticker.currency_pair.is_empty() {
                continue;
            }
            prices.insert(
                normalize_symbol(&ticker.currency_pair),
                SpotTicker {
                    price,
                    volume_24h: ticker.quote_volume.parse::<f64>().ok(),
                },
            );
        }
        Ok(prices)
    }

    async fn snapshot_futures(&self) -> Result<HashMap<String, f64>> {
        let url = format!("{}/futures/usdt/tickers", self.core.endpoints.futures_rest);
        let value = self.core.rest.get_json(&url).await?;
        let tickers: Vec<FuturesTickerEntry> =
            serde_json::from_value(value).context("gateio: bad futures tickers payload")?;

        let mut prices = HashMap::new();
        for ticker in tickers {
            if ticker.contract.is_empty() {
                continue;
            }
            let Some(price) = json_f64(&ticker.last).filter(|p| *p > 0.0) else {
                continue;
            };
            prices.insert(normalize_symbol(&ticker.contract), price);
        }
        Ok(prices)
    }

    async fn spot_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/spot/tickers", self.core.endpoints.spot_rest);
        let pair = self.venue_name(symbol);
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("currency_pair", pair.as_str())])
            .await?;

        let price = value
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| item.get("last"))
            .and_then(json_f64);
        Ok(price.filter(|p| *p > 0.0))
    }

    async fn futures_price(&self, symbol: &str) -> Result<Option<f64>> {
        let contract = self.venue_name(symbol);
        let url = format!(
            "{}/futures/usdt/contracts/{}/tickers",
            self.core.endpoints.futures_rest, contract
        );
        let value = self.core.rest.get_json(&url).await?;
        Ok(value.get("last").and_then(json_f64).filter(|p| *p > 0.0))
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

    fn known(symbols: &[&str]) -> HashSet<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_spot_ticker_update() {
        let frame = r#"{
            "time": 1700000000,
            "channel": "spot.tickers",
            "event": "update",
            "result": {
                "currency_pair": "BTC_USDT",
                "last": "30123.45",
                "quote_volume": "98765432.1"
            }
        }"#;

        let update = GateIoConnector::parse_spot_message(frame, &known(&["BTCUSDT"]))
            .unwrap()
            .expect("should parse");

        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price, 30123.45);
        assert_eq!(update.volume_24h, Some(98765432.1));
        assert_eq!(update.market, Market::Spot);
    }

    #[test]
    fn test_parse_spot_ignores_subscribe_ack() {
        let ack = r#"{
            "time": 1700000000,
            "channel": "spot.tickers",
            "event": "subscribe",
            "result": { "status": "success" }
        }"#;
        assert!(GateIoConnector::parse_spot_message(ack, &known(&["BTCUSDT"]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_spot_ignores_other_channels() {
        let frame = r#"{"channel":"spot.trades","result":{"currency_pair":"BTC_USDT","last":"1"}}"#;
        assert!(GateIoConnector::parse_spot_message(frame, &known(&["BTCUSDT"]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_futures_strips_settle_prefix() {
        let frame = r#"{
            "channel": "futures.tickers",
            "event": "update",
            "result": { "contract": "USDT_BTC_USDT", "last": 30555.5 }
        }"#;

        let update = GateIoConnector::parse_futures_message(frame, &known(&["BTCUSDT"]))
            .unwrap()
            .expect("should parse");

        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price, 30555.5);
        assert_eq!(update.market, Market::Futures);
    }

    #[test]
    fn test_parse_futures_accepts_plain_contract_name() {
        let frame = r#"{
            "channel": "futures.tickers",
            "result": { "contract": "ETH_USDT", "last": "2001.5" }
        }"#;
        let update = GateIoConnector::parse_futures_message(frame, &known(&["ETHUSDT"]))
            .unwrap()
            .expect("should parse");
        assert_eq!(update.symbol, "ETHUSDT");
    }

    #[test]
    fn test_parse_rejects_zero_price() {
        let frame = r#"{
            "channel": "spot.tickers",
            "result": { "currency_pair": "BTC_USDT", "last": "0" }
        }"#;
        assert!(GateIoConnector::parse_spot_message(frame, &known(&["BTCUSDT"]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_symbol() {
        let frame = r#"{
            "channel": "spot.tickers",
            "result": { "currency_pair": "WAT_USDT", "last": "5.0" }
        }"#;
        assert!(GateIoConnector::parse_spot_message(frame, &known(&["BTCUSDT"]))
            .unwrap()
            .is_none());
    }
}
