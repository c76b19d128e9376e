//! MEXC connector.
//!
//! Spot feed: per-symbol book-ticker channel on the raw websocket, price
//! taken as the bid/ask mid. Futures feed: `sub.ticker` on the contract
//! websocket (underscore contract names, e.g. `BTC_USDT`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
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
struct SpotExchangeInfo {
    #[serde(default)]
    symbols: Vec<SpotSymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SpotSymbolInfo {
    symbol: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ContractDetail {
    #[serde(default)]
    data: Vec<ContractInfo>,
}

#[derive(Debug, Deserialize)]
struct ContractInfo {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    state: i64,
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "lastPrice", default)]
    last_price: String,
    #[serde(rename = "quoteVolume", default)]
    quote_volume: String,
}

/// Spot book-ticker frame: `{"d": {"s": "BTCUSDT", "b": "...", "a": "..."}}`
#[derive(Debug, Deserialize)]
struct SpotBookTickerMsg {
    d: Option<SpotBookTicker>,
}

#[derive(Debug, Deserialize)]
struct SpotBookTicker {
    #[serde(default)]
    s: String,
    #[serde(default)]
    b: String,
    #[serde(default)]
    a: String,
}

/// Futures ticker push: `{"data": {"symbol": "BTC_USDT", "lastPrice": ...}}`
#[derive(Debug, Deserialize)]
struct FuturesTickerMsg {
    data: Option<FuturesTicker>,
}

#[derive(Debug, Deserialize)]
struct FuturesTicker {
    #[serde(default)]
    symbol: String,
    #[serde(rename = "lastPrice", default)]
    last_price: serde_json::Value,
}

pub struct MexcConnector {
    core: ConnectorCore,
    /// canonical symbol -> venue contract name (`BTCUSDT` -> `BTC_USDT`)
    contract_names: RwLock<HashMap<String, String>>,
}

impl MexcConnector {
    pub fn new(settings: &Settings, sink: PriceSink) -> Result<Self> {
        Ok(Self {
            core: ConnectorCore::new(Exchange::Mexc, settings, sink)?,
            contract_names: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_symbols(&self) -> Result<()> {
        let url = format!("{}/api/v3/exchangeInfo", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        let info: SpotExchangeInfo =
            serde_json::from_value(value).context("mexc: bad exchangeInfo payload")?;

        let spot: HashSet<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status == "ENABLED" || s.status == "1")
            .map(|s| normalize_symbol(&s.symbol))
            .collect();

        let url = format!("{}/api/v1/contract/detail", self.core.endpoints.futures_rest);
        let value = self.core.rest.get_json(&url).await?;
        let detail: ContractDetail =
            serde_json::from_value(value).context("mexc: bad contract detail payload")?;

        let mut futures = HashSet::new();
        let mut contract_names = HashMap::new();
        for contract in detail.data {
            if contract.state != 0 || contract.symbol.is_empty() {
                continue;
            }
            let canonical = normalize_symbol(&contract.symbol);
            contract_names.insert(canonical.clone(), contract.symbol);
            futures.insert(canonical);
        }

        *self.core.spot_symbols.write() = spot;
        *self.core.futures_symbols.write() = futures;
        *self.contract_names.write() = contract_names;

        info!(
            spot = self.core.spot_symbols.read().len(),
            futures = self.core.futures_symbols.read().len(),
            common = self.core.common_symbols().len(),
            "mexc symbols fetched"
        );
        Ok(())
    }

    fn contract_name(&self, symbol: &str) -> String {
        self.contract_names
            .read()
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| symbol.to_string())
    }

    fn parse_spot_message(
        text: &str,
        known: &HashSet<String>,
    ) -> serde_json::Result<Option<PriceUpdate>> {
        let msg: SpotBookTickerMsg = serde_json::from_str(text)?;
        let Some(ticker) = msg.d else {
            return Ok(None);
        };

        let symbol = normalize_symbol(&ticker.s);
        if symbol.is_empty() || !known.contains(&symbol) {
            return Ok(None);
        }

        let (Ok(bid), Ok(ask)) = (ticker.b.parse::<f64>(), ticker.a.parse::<f64>()) else {
            return Ok(None);
        };
        if bid <= 0.0 || ask <= 0.0 {
            return Ok(None);
        }

        Ok(Some(PriceUpdate::new(
            Exchange::Mexc,
            Market::Spot,
            symbol,
            (bid + ask) / 2.0,
        )))
    }

    fn parse_futures_message(
        text: &str,
        known: &HashSet<String>,
    ) -> serde_json::Result<Option<PriceUpdate>> {
        let msg: FuturesTickerMsg = serde_json::from_str(text)?;
        let Some(ticker) = msg.data else {
            return Ok(None);
        };

        let symbol = normalize_symbol(&ticker.symbol);
        if symbol.is_empty() || !known.contains(&symbol) {
            return Ok(None);
        }

        let Some(price) = json_f64(&ticker.last_price).filter(|p| *p > 0.0) else {
            return Ok(None);
        };

        Ok(Some(PriceUpdate::new(
            Exchange::Mexc,
            Market::Futures,
            symbol,
            price,
        )))
    }

    async fn run_spot_ws(&self) -> Result<()> {
        let stream = ws_connect(self.core.endpoints.spot_ws).await?;
        let (mut write, mut read) = stream.split();

        let symbols = self.core.subscription_symbols();
        for symbol in &symbols {
            let subscribe = serde_json::json!({
                "method": "SUBSCRIPTION",
                "params": [format!("spot@public.aggre.bookTicker.v3.api.pb@{symbol}")],
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .context("mexc: spot subscribe failed")?;
            tokio::time::sleep(SUBSCRIBE_DELAY).await;
        }
        info!(subscriptions = symbols.len(), "mexc spot websocket subscribed");

        let known = self.core.spot_symbols.read().clone();
        while let Some(message) = read.next().await {
            if !self.core.is_running() {
                break;
            }
            match message {
                Ok(Message::Text(text)) => {
                    let received = Instant::now();
                    self.core.metrics.record_ws_message();
                    match Self::parse_spot_message(&text, &known) {
                        Ok(Some(update)) => {
                            let latency_ms = received.elapsed().as_secs_f64() * 1000.0;
                            self.core.emit(update.with_latency(latency_ms));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.core.metrics.inc_errors();
                            debug!(error = %e, "mexc spot frame parse error");
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    write.send(Message::Pong(payload)).await.ok();
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "mexc spot websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("mexc: spot websocket read error"),
            }
        }
        Ok(())
    }

    async fn run_futures_ws(&self) -> Result<()> {
        let stream = ws_connect(self.core.endpoints.futures_ws).await?;
        let (mut write, mut read) = stream.split();

        let symbols = self.core.subscription_symbols();
        for symbol in &symbols {
            let subscribe = serde_json::json!({
                "method": "sub.ticker",
                "param": { "symbol": self.contract_name(symbol) },
            });
            write
                .send(Message::Text(subscribe.to_string()))
                .await
                .context("mexc: futures subscribe failed")?;
            tokio::time::sleep(SUBSCRIBE_DELAY).await;
        }
        info!(
            subscriptions = symbols.len(),
            "mexc futures websocket subscribed"
        );

        let known = self.core.futures_symbols.read().clone();
        while let Some(message) = read.next().await {
            if !self.core.is_running() {
                break;
            }
            match message {
                Ok(Message::Text(text)) => {
                    let received = Instant::now();
                    self.core.metrics.record_ws_message();
                    match Self::parse_futures_message(&text, &known) {
                        Ok(Some(update)) => {
                            let latency_ms = received.elapsed().as_secs_f64() * 1000.0;
                            self.core.emit(update.with_latency(latency_ms));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.core.metrics.inc_errors();
                            debug!(error = %e, "mexc futures frame parse error");
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    write.send(Message::Pong(payload)).await.ok();
                }
                Ok(Message::Close(frame)) => {
                    info!(?frame, "mexc futures websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("mexc: futures websocket read error"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for MexcConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Mexc
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
            run_feed_loop(Exchange::Mexc, "spot", running, delay, metrics, move || {
                let c = c.clone();
                async move { c.run_spot_ws().await }
            })
            .await;
        }));

        let conn = self.clone();
        self.core.track_task(tokio::spawn(async move {
            let running = conn.core.running.clone();
            let metrics = conn.core.metrics.clone();
            let delay = conn.core.reconnect_delay;
            let c = conn.clone();
            run_feed_loop(Exchange::Mexc, "futures", running, delay, metrics, move || {
                let c = c.clone();
                async move { c.run_futures_ws().await }
            })
            .await;
        }));

        Ok(())
    }

    async fn close(&self) {
        self.core.shutdown();
    }

    async fn snapshot_spot(&self) -> Result<HashMap<String, SpotTicker>> {
        let url = format!("{}/api/v3/ticker/24hr", self.core.endpoints.spot_rest);
        let value = self.core.rest.get_json(&url).await?;
        let tickers: Vec<Ticker24h> =
            serde_json::from_value(value).context("mexc: bad 24h ticker payload")?;

        let mut prices = HashMap::new();
        for ticker in tickers {
            let Ok(price) = ticker.last_price.parse::<f64>() else {
                continue;
            };
            if price <= 0.0 {
                continue;
            }
            prices.insert(
                normalize_symbol(&ticker.symbol),
                SpotTicker {
                    price,
                    volume_24h: ticker.quote_volume.parse::<f64>().ok(),
                },
            );
        }
        Ok(prices)
    }

    async fn snapshot_futures(&self) -> Result<HashMap<String, f64>> {
        let url = format!("{}/api/v1/contract/ticker", self.core.endpoints.futures_rest);
        let value = self.core.rest.get_json(&url).await?;

        let mut prices = HashMap::new();
        if let Some(items) = value.get("data").and_then(|d| d.as_array()) {
            for item in items {
                let Some(symbol) = item.get("symbol").and_then(|s| s.as_str()) else {
                    continue;
                };
                let Some(price) = item.get("lastPrice").and_then(json_f64).filter(|p| *p > 0.0)
                else {
                    continue;
                };
                prices.insert(normalize_symbol(symbol), price);
            }
        }
        Ok(prices)
    }

    async fn spot_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v3/ticker/price", self.core.endpoints.spot_rest);
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("symbol", symbol)])
            .await?;
        Ok(value.get("price").and_then(json_f64))
    }

    async fn futures_price(&self, symbol: &str) -> Result<Option<f64>> {
        let url = format!("{}/api/v1/contract/ticker", self.core.endpoints.futures_rest);
        let contract = self.contract_name(symbol);
        let value = self
            .core
            .rest
            .get_json_with_query(&url, &[("symbol", contract.as_str())])
            .await?;

        // The single-symbol endpoint answers with either one object or a
        // one-element list under `data`.
        let data = value.get("data");
        let price = match data {
            Some(serde_json::Value::Array(items)) => items
                .first()
                .and_then(|item| item.get("lastPrice"))
                .and_then(json_f64),
            Some(item) => item.get("lastPrice").and_then(json_f64),
            None => None,
        };
        Ok(price.filter(|p| *p > 0.0))
    }

    fn common_symbols(&self) -> HashSet<String> {
        self.core.common_symbols()
    }

    fn stats(&self) -> ConnectorStats {
        self.core.stats()
    }
}
