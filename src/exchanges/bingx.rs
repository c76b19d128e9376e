//! BingX connector.
//!
//! Both sockets take a single all-tickers subscription instead of
//! per-symbol channels. The protocol wants a text `"ping"` every 20 s and
//! answers with a text `"pong"`. Venue symbols are hyphenated
//! (`BTC-USDT`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

use crate::config::Settings;
use crate::exchanges::{
    json_f64, run_feed_loop, ws_connect, ConnectorCore, ConnectorStats, ExchangeConnector,
    PriceSink, SpotTicker,
};
use crate::models::{normalize_symbol, Exchange, Market, PriceUpdate};

const PING_INTERVAL: Duration = Duration::from_secs(20);

/// No frame at all for this long (several missed pongs) means the socket
/// is dead even if the TCP side still looks open.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    data: Option<SymbolsData>,
}

#[derive(Debug, Deserialize)]
struct SymbolsData {
    #[serde(default)]
    symbols: Vec<SpotSymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SpotSymbolInfo {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    status: i64,
}

#[derive(Debug, Deserialize)]
struct ContractsResponse {
    #[serde(default)]
    data: Vec<ContractInfo>,
}

#[derive(Debug, Deserialize)]
struct ContractInfo {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    status: i64,
}

/// Ticker push: `{"dataType": "ticker", "data": {"symbol": "BTC-USDT", "price": ...}}`
#[derive(Debug, Deserialize)]
struct TickerMsg {
    #[serde(rename = "dataType", default)]
    data_type: String,
    data: Option<TickerData>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    price: serde_json::Value,
}

pub struct BingXConnector {
    core: ConnectorCore,
    /// canonical symbol -> venue symbol (`BTCUSDT` -> `BTC-USDT`)
    venue_names: parking_lot::RwLock<HashMap<String, String>>,
}

impl BingXConnector {
    pub fn new(settings: &Settings, sink: PriceSink) -> Result<Self> {
        Ok(Self {
            core: ConnectorCore::new(Exchange::BingX, settings, sink)?,
            venue_names: parking_lot::RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_symbols(&self) -> Result<()> {
        let url = format!(
            "{}/openApi/spot/v1/common/symbols",
            self.core.endpoints.spot_rest
        );
        let value = self.core.rest.get_json(&url).await?;
        let response: SymbolsResponse =
            serde_json::from_value(value).context("bingx: bad spot symbols payload")?;

        let mut spot = HashSet::new();
        let mut venue_names = HashMap::new();
        for info in response.data.map(|d| d.symbols).unwrap_or_default() {
            if info.status != 1 || info.symbol.is_empty() {
                continue;
            }
            let canonical = normalize_symbol(&info.symbol);
            venue_names.insert(canonical.clone(), info.symbol);
            spot.insert(canonical);
        }

        let url = format!(
            "{}/openApi/swap/v2/quote/contracts",
            self.core.endpoints.futures_rest
        );
        let value = self.core.rest.get_json(&url).await?;
        let response: ContractsResponse =
            serde_json::from_value(value).context("bingx: bad contracts payload")?;

        let mut futures = HashSet::new();
        for contract in response.data {
            if contract.status != 1 || contract.symbol.is_empty() {
                continue;
            }
            let canonical = normalize_symbol(&contract.symbol);
            venue_names.entry(canonical.clone()).or_insert(contract.symbol);
            futures.insert(canonical);
        }

        *self.core.spot_symbols.write() = spot;
        *self.core.futures_symbols.write() = futures;
        *self.venue_names.write() = venue_names;

        info!(
            spot = self.core.spot_symbols.read().len(),
            futures = self.core.futures_symbols.read().len(),
            common = self.core.common_symbols().len(),
            "bingx symbols fetched"
        );
        Ok(())
    }

    fn venue_name(&self, symbol: &str) -> String {
        if let Some(name) = self.venue_names.read().get(symbol) {
            return name.clone();
        }
        if symbol.len() > 4 && symbol.ends_with("USDT") {
            format!("{}-{}", &symbol[..symbol.len() - 4], "USDT")
        } else {
            symbol.to_string()
        }
    }

    fn parse_ticker_message(
        text: &str,
        market: Market,
        known: &HashSet<String>,
    ) -> serde_json::Result<Option<PriceUpdate>> {
        let msg: TickerMsg = serde_json::from_str(text)?;
        if !msg.data_type.contains("ticker") {
            return Ok(None);
        }
        let Some(data) = msg.data else {
            return Ok(None);
        };

        let symbol = normalize_symbol(&data.symbol);
        if symbol.is_empty() || !known.contains(&symbol) {
            return Ok(None);
        }

        let Some(price) = json_f64(&data.price).filter(|p| *p > 0.0) else {
            return Ok(None);
        };

        Ok(Some(PriceUpdate::new(Exchange::BingX, market, symbol, price)))
    }

    async fn run_ws(&self, market: Market) -> Result<()> {
        let (url, subscribe_id) = match market {
            Market::Spot => (self.core.endpoints.spot_ws, "spot_ticker_all"),
            Market::Futures => (self.core.endpoints.futures_ws, "swap_ticker_all"),
        };

        let stream = ws_connect(url).await?;
        let (mut write, mut read) = stream.split();

        let subscribe = serde_json::json!({
            "id": subscribe_id,
            "requestType": "subscribe",
            "dataType": "ticker",
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("bingx: subscribe failed")?;
        info!(market = %market, "bingx websocket subscribed to all tickers");

        let known = match market {
            Market::Spot => self.core.spot_symbols.read().clone(),
            Market::Futures => self.core.futures_symbols.read().clone(),
        };

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    if last_frame.elapsed() > HEARTBEAT_TIMEOUT {
                        anyhow::bail!("bingx: {market} heartbeat timed out");
                    }
                    write
                        .send(Message::Text("ping".to_string()))
                        .await
                        .context("bingx: ping failed")?;
                }
                message = read.next() => {
                    let Some(message) = message else { break };
                    if !self.core.is_running() {
                        break;
                    }
                    last_frame = Instant::now();
                    match message {
                        Ok(Message::Text(text)) => {
                            if text == "pong" {
                                continue;
                            }
                            let received = Instant::now();
                            self.core.metrics.record_ws_message();
                            match Self::parse_ticker_message(&text, market, &known) {
                                Ok(Some(update)) => {
                                    let latency_ms = received.elapsed().as_secs_f64() * 1000.0;
                                    self.core.emit(update.with_latency(latency_ms));
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    self.core.metrics.inc_errors();
                                    debug!(market = %market, error = %e, "bingx frame parse error");
                                }
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            write.send(Message::Pong(payload)).await.ok();
                        }
                        Ok(Message::Close(frame)) => {
                            info!(market = %market, ?frame, "bingx websocket closed by server");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => return Err(e).context("bingx: websocket read error"),
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for BingXConnector {
    fn exchange(&self) -> Exchange {
        Exchange::BingX
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
                run_feed_loop(Exchange::BingX, label, running, delay, metrics, move || {
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
        let url = format!(
            "{}/openApi/spot/v1/ticker/price",
            self.core.endpoints.spot_rest
        );
        let value = self.core.rest.get_json(&url).await?;

        let mut prices = HashMap::new();
        if let Some(items) = value.get("data").and_then(|d| d.as_array()) {
            for item in items {
                let Some(symbol) = item.get("symbol").and_then(|s| s.as_str()) else {
                    continue;
                };
                // Price arrives inside the latest-trades array
                let Some(price) = item
                    .get("trades")
                    .and_then(|t| t.as_array())
                    .and_then(|t| t.first())
                    .and_then(|t| t.get("price"))
                    .and_then(json_f64)
                    .filter(|p| *p > 0.0)
                else {
                    continue;
                };
                prices.insert(
                    normalize_symbol(symbol),
                    SpotTicker {
                        price,
                        volume_24h: None,
                    },
                );
            }
        }
        Ok(prices)
    }

    async fn snapshot_futures(&self) -> Result<HashMap<String, f64>> {
        let url = format!(
            "{}/openApi/swap/v2/quote/price",
            self.core.endpoints.futures_rest
        );
        let value = self.core.rest.get_json(&url).await?;

        let mut prices = HashMap::new();
        if let Some(items) = value.get("data").and_then(|d| d.as_array()) {
            for item in items {
                let Some(symbol) = item.get("symbol").and_then(|s| s.as_str()) else {
                    continue;
                };
                let Some(price) = item.get("price").and_then(json_f64).filter(|p| *p > 0.0)
                else {
                    continue;
                };
                prices.insert(normalize_symbol(symbol), price);
            }
        }
        Ok(prices)
    }

    async fn spot_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!(
            "{}/openApi/spot/v1/ticker/price",
            self.core.endpoints.spot_rest
        );
        let venue = self.venue_name(symbol);
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("symbol", venue.as_str())])
            .await?;
        let price = value
            .get("data")
            .and_then(|d| d.get("price"))
            .and_then(json_f64);
        Ok(price.filter(|p| *p > 0.0))
    }

    async fn futures_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!(
            "{}/openApi/swap/v2/quote/price",
            self.core.endpoints.futures_rest
        );
        let venue = self.venue_name(symbol);
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("symbol", venue.as_str())])
            .await?;
        let price = value
            .get("data")
            .and_then(|d| d.get("price"))
            .and_then(json_f64);
        Ok(price.filter(|p| *p > 0.0))
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
    fn test_parse_spot_ticker_normalizes_hyphen() {
        let frame = r#"{"dataType":"ticker","data":{"symbol":"BTC-USDT","price":30123.4}}"#;
        let update = BingXConnector::parse_ticker_message(frame, Market::Spot, &known(&["BTCUSDT"]))
            .unwrap()
            .expect("should parse");

        assert_eq!(update.exchange, Exchange::BingX);
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price, 30123.4);
    }

    #[test]
    fn test_parse_futures_ticker() {
        let frame = r#"{"dataType":"swap.ticker","data":{"symbol":"ETH-USDT","price":"2050.5"}}"#;
        let update =
            BingXConnector::parse_ticker_message(frame, Market::Futures, &known(&["ETHUSDT"]))
                .unwrap()
                .expect("should parse");

        assert_eq!(update.market, Market::Futures);
        assert_eq!(update.price, 2050.5);
    }

    #[test]
    fn test_parse_ignores_non_ticker_frames() {
        let ack = r#"{"id":"spot_ticker_all","code":0,"msg":"SUCCESS"}"#;
        assert!(
            BingXConnector::parse_ticker_message(ack, Market::Spot, &known(&["BTCUSDT"]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_bad_price() {
        let unknown = r#"{"dataType":"ticker","data":{"symbol":"WAT-USDT","price":1.0}}"#;
        assert!(
            BingXConnector::parse_ticker_message(unknown, Market::Spot, &known(&["BTCUSDT"]))
                .unwrap()
                .is_none()
        );

        let zero = r#"{"dataType":"ticker","data":{"symbol":"BTC-USDT","price":0}}"#;
        assert!(
            BingXConnector::parse_ticker_message(zero, Market::Spot, &known(&["BTCUSDT"]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_venue_name_fallback() {
        // No map populated: derives the hyphenated form
        let settings = crate::config::Settings::default();
        let sink: PriceSink = Arc::new(|_| {});
        let connector = BingXConnector::new(&settings, sink).unwrap();
        assert_eq!(connector.venue_name("BTCUSDT"), "BTC-USDT");
    }
}
