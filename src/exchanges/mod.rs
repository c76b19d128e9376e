//! Exchange connectors.
//!
//! One module per venue, all implementing [`ExchangeConnector`]: discover
//! tradable symbols, keep spot and futures feeds alive, normalize venue
//! messages to canonical [`PriceUpdate`]s and push them through the
//! registered [`PriceSink`]. Connectors never hold a reference back to the
//! engine; the sink callback is the only coupling.

pub mod bingx;
pub mod gateio;
pub mod htx;
pub mod mexc;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use crate::config::Settings;
use crate::limits::{CircuitBreaker, RateLimiter};
use crate::models::{Exchange, PriceUpdate};

pub use bingx::BingXConnector;
pub use gateio::GateIoConnector;
pub use htx::HtxConnector;
pub use mexc::MexcConnector;

/// Callback every connector pushes price updates through.
pub type PriceSink = Arc<dyn Fn(PriceUpdate) + Send + Sync>;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Cap on per-symbol subscriptions per feed side.
pub const MAX_SYMBOL_SUBSCRIPTIONS: usize = 50;

/// Spacing between per-symbol subscribe messages (keeps us under 20 msg/s).
pub const SUBSCRIBE_DELAY: Duration = Duration::from_millis(50);

const REST_RATE_PER_SEC: f64 = 10.0;
const REST_BURST_CAPACITY: u32 = 20;
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY: Duration = Duration::from_secs(30);

/// Point-in-time connector counters.
#[derive(Debug, Clone)]
pub struct ConnectorStats {
    pub exchange: Exchange,
    pub running: bool,
    pub spot_symbols: usize,
    pub futures_symbols: usize,
    pub rest_requests: u64,
    pub ws_messages: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_update: Option<DateTime<Utc>>,
}

/// Shared mutable counters; each connector owns one instance and is the
/// only writer of its own stats.
#[derive(Default)]
pub struct ConnectorMetrics {
    pub rest_requests: AtomicU64,
    pub ws_messages: AtomicU64,
    pub errors: AtomicU64,
    pub reconnects: AtomicU64,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

impl ConnectorMetrics {
    pub fn record_ws_message(&self) {
        self.ws_messages.fetch_add(1, Ordering::Relaxed);
        *self.last_update.lock() = Some(Utc::now());
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark data as fresh without counting a websocket message (REST polls).
    pub fn touch(&self) {
        *self.last_update.lock() = Some(Utc::now());
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        *self.last_update.lock()
    }
}

/// One spot ticker from a REST snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotTicker {
    pub price: f64,
    pub volume_24h: Option<f64>,
}

/// Contract implemented by every venue connector.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> Exchange;

    /// Fetch tradable symbols and prepare the HTTP client side.
    async fn initialize(&self) -> Result<()>;

    /// Spawn the long-running spot and futures feed loops.
    async fn start_feeds(self: Arc<Self>) -> Result<()>;

    /// Stop feed loops and drop connections.
    async fn close(&self);

    /// REST fallback: all spot tickers, canonical symbol -> price (+volume).
    async fn snapshot_spot(&self) -> Result<HashMap<String, SpotTicker>>;

    /// REST fallback: all futures tickers, canonical symbol -> price.
    async fn snapshot_futures(&self) -> Result<HashMap<String, f64>>;

    /// Per-symbol REST fallbacks.
    async fn spot_price(&self, symbol: &str) -> Result<Option<f64>>;
    async fn futures_price(&self, symbol: &str) -> Result<Option<f64>>;

    /// Symbols tradable on both the venue's spot and futures markets.
    fn common_symbols(&self) -> HashSet<String>;

    fn stats(&self) -> ConnectorStats;
}

/// Pull an f64 out of a JSON value that may be a number or a string.
pub(crate) fn json_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// State and plumbing shared by every connector: HTTP access, stats, the
/// stop flag, feed task handles and the discovered symbol sets.
pub struct ConnectorCore {
    pub exchange: Exchange,
    pub endpoints: crate::config::Endpoints,
    sink: PriceSink,
    pub metrics: Arc<ConnectorMetrics>,
    pub rest: RestClient,
    pub running: Arc<AtomicBool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub spot_symbols: parking_lot::RwLock<HashSet<String>>,
    pub futures_symbols: parking_lot::RwLock<HashSet<String>>,
    pub reconnect_delay: Duration,
}

impl ConnectorCore {
    pub fn new(exchange: Exchange, settings: &Settings, sink: PriceSink) -> Result<Self> {
        let metrics = Arc::new(ConnectorMetrics::default());
        let rest = RestClient::new(exchange, metrics.clone())?;
        Ok(Self {
            exchange,
            endpoints: crate::config::endpoints(exchange),
            sink,
            metrics,
            rest,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            spot_symbols: parking_lot::RwLock::new(HashSet::new()),
            futures_symbols: parking_lot::RwLock::new(HashSet::new()),
            reconnect_delay: settings.ws_reconnect_delay,
        })
    }

    pub fn emit(&self, update: PriceUpdate) {
        (self.sink)(update);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn common_symbols(&self) -> HashSet<String> {
        let spot = self.spot_symbols.read();
        let futures = self.futures_symbols.read();
        spot.intersection(&futures).cloned().collect()
    }

    /// Deterministic subscription plan for per-symbol venues: the first
    /// `MAX_SYMBOL_SUBSCRIPTIONS` common symbols in sorted order.
    pub fn subscription_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.common_symbols().into_iter().collect();
        symbols.sort_unstable();
        symbols.truncate(MAX_SYMBOL_SUBSCRIPTIONS);
        symbols
    }

    pub fn track_task(&self, handle: tokio::task::JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn start_running(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop-flag flip plus task teardown; shared by every `close()`.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!(exchange = %self.exchange, "exchange connector closed");
    }

    pub fn stats(&self) -> ConnectorStats {
        ConnectorStats {
            exchange: self.exchange,
            running: self.is_running(),
            spot_symbols: self.spot_symbols.read().len(),
            futures_symbols: self.futures_symbols.read().len(),
            rest_requests: self.metrics.rest_requests.load(Ordering::Relaxed),
            ws_messages: self.metrics.ws_messages.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            last_update: self.metrics.last_update(),
        }
    }
}

/// Build the connector for a venue, wiring in the price sink.
pub fn build_connector(
    exchange: Exchange,
    settings: &Settings,
    sink: PriceSink,
) -> Result<Arc<dyn ExchangeConnector>> {
    Ok(match exchange {
        Exchange::Mexc => Arc::new(MexcConnector::new(settings, sink)?),
        Exchange::GateIo => Arc::new(GateIoConnector::new(settings, sink)?),
        Exchange::BingX => Arc::new(BingXConnector::new(settings, sink)?),
        Exchange::Htx => Arc::new(HtxConnector::new(settings, sink)?),
    })
}

/// REST access shared by all connectors: pooled client, token-bucket
/// limiter and circuit breaker in front of every request.
pub struct RestClient {
    http: reqwest::Client,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    metrics: Arc<ConnectorMetrics>,
    exchange: Exchange,
}

impl RestClient {
    pub fn new(exchange: Exchange, metrics: Arc<ConnectorMetrics>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            limiter: RateLimiter::new(REST_RATE_PER_SEC, REST_BURST_CAPACITY),
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_RECOVERY),
            metrics,
            exchange,
        })
    }

    /// GET a JSON document. Transport failures and 429/5xx feed the circuit
    /// breaker; malformed bodies only bump the error counter.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        self.get_json_with_query::<&str>(url, &[]).await
    }

    pub async fn get_json_with_query<V: AsRef<str>>(
        &self,
        url: &str,
        query: &[(&str, V)],
    ) -> Result<serde_json::Value> {
        self.limiter.acquire().await;

        if !self.breaker.allow() {
            anyhow::bail!("{}: circuit breaker open, skipping {url}", self.exchange);
        }

        let mut request = self.http.get(url);
        if !query.is_empty() {
            let pairs: Vec<(&str, &str)> = query.iter().map(|(k, v)| (*k, v.as_ref())).collect();
            request = request.query(&pairs);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                self.metrics.inc_errors();
                return Err(e).with_context(|| format!("{}: request failed: {url}", self.exchange));
            }
        };

        self.metrics.rest_requests.fetch_add(1, Ordering::Relaxed);
        let status = response.status();

        if status.is_success() {
            self.breaker.record_success();
            match response.json::<serde_json::Value>().await {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.metrics.inc_errors();
                    Err(e).with_context(|| format!("{}: invalid JSON from {url}", self.exchange))
                }
            }
        } else {
            self.metrics.inc_errors();
            // 429 and server errors count against the breaker, plain client
            // errors are request bugs and do not.
            if status.as_u16() == 429 || status.is_server_error() {
                self.breaker.record_failure();
            }
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "{}: REST error {status} from {url}: {}",
                self.exchange,
                &body[..body.len().min(200)]
            )
        }
    }
}

/// Open a WebSocket connection.
pub async fn ws_connect(url: &str) -> Result<WsStream> {
    let (stream, response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect websocket: {url}"))?;
    info!(url, status = %response.status(), "websocket connected");
    Ok(stream)
}

/// Reconnect loop wrapped around one feed connection. Runs until the stop
/// flag flips; every failed or closed connection counts one reconnect and
/// waits `reconnect_delay` before the next attempt.
pub async fn run_feed_loop<F, Fut>(
    exchange: Exchange,
    label: &str,
    running: Arc<AtomicBool>,
    reconnect_delay: Duration,
    metrics: Arc<ConnectorMetrics>,
    mut connect: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    while running.load(Ordering::Relaxed) {
        match connect().await {
            Ok(()) => info!(%exchange, label, "feed connection closed"),
            Err(e) => {
                metrics.inc_errors();
                warn!(%exchange, label, error = %e, "feed error");
            }
        }

        if !running.load(Ordering::Relaxed) {
            break;
        }

        metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(%exchange, label, delay_secs = reconnect_delay.as_secs(), "reconnecting feed");
        tokio::time::sleep(reconnect_delay).await;
    }
    info!(%exchange, label, "feed loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_feed_loop_counts_reconnects_and_keeps_running() {
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(ConnectorMetrics::default());
        let attempts = Arc::new(AtomicU32::new(0));

        // Three connection drops, then a clean close that stops the loop.
        let loop_running = running.clone();
        let loop_attempts = attempts.clone();
        run_feed_loop(
            Exchange::Mexc,
            "spot",
            running.clone(),
            Duration::from_millis(1),
            metrics.clone(),
            move || {
                let running = loop_running.clone();
                let attempts = loop_attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        anyhow::bail!("socket dropped")
                    }
                    running.store(false, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await;

        assert_eq!(metrics.reconnects.load(Ordering::SeqCst), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_feed_loop_exits_immediately_when_stopped() {
        let running = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(ConnectorMetrics::default());

        run_feed_loop(
            Exchange::Htx,
            "futures",
            running,
            Duration::from_millis(1),
            metrics.clone(),
            || async { panic!("must not connect") },
        )
        .await;

        assert_eq!(metrics.reconnects.load(Ordering::SeqCst), 0);
    }
}
