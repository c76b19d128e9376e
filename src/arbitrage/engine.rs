//! Monitoring engine.
//!
//! Owns the price cache, the spread calculator, the alert cooldown and one
//! connector per enabled exchange. Connectors push every update into the
//! cache through a callback; the scan loop turns the cache into ranked
//! opportunities and publishes the top of the list through the cooldown
//! gate to the alert sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::arbitrage::{AlertCooldown, SpreadCalculator};
use crate::cache::{CacheStats, PriceCache};
use crate::config::Settings;
use crate::exchanges::{build_connector, ConnectorStats, ExchangeConnector, PriceSink};
use crate::models::{Exchange, SpreadAlert, SpreadOpportunity};
use crate::notify::AlertSink;

/// Only the best opportunities of a scan are offered to the sink.
const TOP_ALERTS_PER_SCAN: usize = 5;

/// Backoff after a failed scan iteration.
const SCAN_ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub running: bool,
    pub uptime_seconds: u64,
    pub prices_received: u64,
    pub opportunities_found: u64,
    pub alerts_sent: u64,
    pub errors: u64,
    pub cache: CacheStats,
    pub connectors: HashMap<Exchange, ConnectorStats>,
}

pub struct MonitorEngine {
    settings: Settings,
    cache: Arc<PriceCache>,
    calculator: SpreadCalculator,
    cooldown: AlertCooldown,
    sink: Arc<dyn AlertSink>,
    connectors: RwLock<Vec<Arc<dyn ExchangeConnector>>>,
    running: Arc<AtomicBool>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
    prices_received: Arc<AtomicU64>,
    opportunities_found: AtomicU64,
    alerts_sent: AtomicU64,
    errors: AtomicU64,
    last_opportunities: RwLock<Vec<SpreadOpportunity>>,
}

impl MonitorEngine {
    pub fn new(settings: Settings, sink: Arc<dyn AlertSink>) -> Self {
        let cache = Arc::new(PriceCache::new(settings.cache_ttl));
        let calculator = SpreadCalculator::new(cache.clone(), settings.spread_threshold);
        let cooldown = AlertCooldown::new(settings.notification_cooldown);

        Self {
            settings,
            cache,
            calculator,
            cooldown,
            sink,
            connectors: RwLock::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            scan_task: Mutex::new(None),
            started_at: Mutex::new(None),
            prices_received: Arc::new(AtomicU64::new(0)),
            opportunities_found: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_opportunities: RwLock::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &Arc<PriceCache> {
        &self.cache
    }

    /// Build and initialize one connector per enabled exchange. Individual
    /// failures are logged and tolerated; every connector failing to come
    /// up is fatal.
    pub async fn initialize(&self) -> Result<()> {
        info!(
            exchanges = self.settings.enabled_exchanges.len(),
            threshold = self.settings.spread_threshold,
            "initializing monitoring engine"
        );

        let sink = self.price_sink();
        let mut initialized: Vec<Arc<dyn ExchangeConnector>> = Vec::new();

        for &exchange in Exchange::ALL.iter() {
            if !self.settings.enabled_exchanges.contains(&exchange) {
                continue;
            }
            let connector = match build_connector(exchange, &self.settings, sink.clone()) {
                Ok(connector) => connector,
                Err(e) => {
                    error!(%exchange, error = %e, "failed to build connector");
                    continue;
                }
            };
            match connector.initialize().await {
                Ok(()) => {
                    info!(%exchange, "exchange connector initialized");
                    initialized.push(connector);
                }
                Err(e) => {
                    error!(%exchange, error = %e, "failed to initialize connector");
                }
            }
        }

        if initialized.is_empty() {
            anyhow::bail!("no exchange connector could be initialized");
        }

        *self.connectors.write() = initialized;
        Ok(())
    }

    /// The callback every connector feeds. Routes updates straight into
    /// the cache; no back-reference to the engine is handed out.
    fn price_sink(&self) -> PriceSink {
        let cache = self.cache.clone();
        let prices_received = self.prices_received.clone();
        Arc::new(move |update| {
            prices_received.fetch_add(1, Ordering::Relaxed);
            cache.update(update);
        })
    }

    /// Start all feeds and the scan loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.started_at.lock() = Some(Instant::now());

        let connectors = self.connectors.read().clone();
        for connector in connectors {
            let exchange = connector.exchange();
            if let Err(e) = connector.start_feeds().await {
                error!(%exchange, error = %e, "failed to start feeds");
            }
        }

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.scan_loop().await;
        });
        *self.scan_task.lock() = Some(handle);

        info!("monitoring started");
        Ok(())
    }

    async fn scan_loop(self: Arc<Self>) {
        info!(
            interval_secs = self.settings.scan_interval.as_secs_f64(),
            "scan loop started"
        );

        while self.running.load(Ordering::Relaxed) {
            match self.scan_tick().await {
                Ok(()) => tokio::time::sleep(self.settings.scan_interval).await,
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    error!(error = %e, "scan loop error");
                    tokio::time::sleep(SCAN_ERROR_BACKOFF).await;
                }
            }
        }

        info!("scan loop stopped");
    }

    /// One scan iteration: rank opportunities, alert the top of the list
    /// through the cooldown gate, sweep the cache.
    pub async fn scan_tick(&self) -> Result<()> {
        let opportunities = self.calculator.find_opportunities(None);

        if !opportunities.is_empty() {
            self.opportunities_found
                .fetch_add(opportunities.len() as u64, Ordering::Relaxed);
            *self.last_opportunities.write() = opportunities.clone();

            for opp in opportunities.iter().take(TOP_ALERTS_PER_SCAN) {
                if !self.cooldown.may_emit(&opp.base_asset, Utc::now()) {
                    continue;
                }
                self.alerts_sent.fetch_add(1, Ordering::Relaxed);
                self.sink
                    .deliver(SpreadAlert::new(opp.clone()))
                    .await
                    .context("alert sink failed")?;
            }
        }

        self.cache.evict_expired();
        Ok(())
    }

    /// Force an immediate scan, bypassing cooldown and alerting.
    pub fn scan_once(&self) -> Vec<SpreadOpportunity> {
        self.calculator.find_opportunities(None)
    }

    /// Result of the most recent scan that found anything.
    pub fn current_opportunities(&self) -> Vec<SpreadOpportunity> {
        self.last_opportunities.read().clone()
    }

    /// Stop the scan loop, close every connector concurrently, drop the
    /// cached prices.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.scan_task.lock().take() {
            handle.abort();
        }

        let connectors = self.connectors.read().clone();
        join_all(connectors.iter().map(|c| c.close())).await;

        self.cache.clear();
        info!("monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> EngineStats {
        let uptime_seconds = (*self.started_at.lock())
            .map(|at| at.elapsed().as_secs())
            .unwrap_or(0);

        let connectors = self
            .connectors
            .read()
            .iter()
            .map(|c| (c.exchange(), c.stats()))
            .collect();

        EngineStats {
            running: self.is_running(),
            uptime_seconds,
            prices_received: self.prices_received.load(Ordering::Relaxed),
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cache: self.cache.stats(),
            connectors,
        }
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.scan_task.lock().take() {
            handle.abort();
        }
        if self.running.load(Ordering::Relaxed) {
            warn!("engine dropped while running");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Market, PriceUpdate};
    use async_trait::async_trait;

    struct RecordingSink {
        alerts: Mutex<Vec<SpreadAlert>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alerts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn deliver(&self, alert: SpreadAlert) -> Result<()> {
            self.alerts.lock().push(alert);
            Ok(())
        }
    }

    fn settings() -> Settings {
        Settings::default()
    }

    fn seed(engine: &MonitorEngine, exchange: Exchange, market: Market, symbol: &str, price: f64) {
        engine
            .cache()
            .update(PriceUpdate::new(exchange, market, symbol, price));
    }

    #[tokio::test]
    async fn test_scan_tick_alerts_top_five_only() {
        let sink = RecordingSink::new();
        let engine = MonitorEngine::new(settings(), sink.clone());

        // Seven qualifying assets with distinct spreads
        for (i, base) in ["AAA", "BBB", "CCC", "DDD", "EEE", "FFF", "GGG"]
            .iter()
            .enumerate()
        {
            let symbol = format!("{base}USDT");
            seed(&engine, Exchange::Mexc, Market::Spot, &symbol, 100.0);
            seed(
                &engine,
                Exchange::GateIo,
                Market::Futures,
                &symbol,
                104.0 + i as f64,
            );
        }

        engine.scan_tick().await.unwrap();

        let alerts = sink.alerts.lock();
        assert_eq!(alerts.len(), 5);
        // Highest spread first: GGG got futures at 110
        assert_eq!(alerts[0].opportunity.base_asset, "GGG");
        assert_eq!(engine.stats().alerts_sent, 5);
        assert_eq!(engine.stats().opportunities_found, 7);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_alerts() {
        let sink = RecordingSink::new();
        let engine = MonitorEngine::new(settings(), sink.clone());

        seed(&engine, Exchange::Mexc, Market::Spot, "SOLUSDT", 100.0);
        seed(&engine, Exchange::GateIo, Market::Futures, "SOLUSDT", 105.0);

        engine.scan_tick().await.unwrap();
        engine.scan_tick().await.unwrap();

        assert_eq!(sink.alerts.lock().len(), 1);
        // The opportunity is still tracked even while suppressed
        assert_eq!(engine.current_opportunities().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_tick_without_data_is_quiet() {
        let sink = RecordingSink::new();
        let engine = MonitorEngine::new(settings(), sink.clone());

        engine.scan_tick().await.unwrap();
        assert!(sink.alerts.lock().is_empty());
        assert_eq!(engine.stats().opportunities_found, 0);
    }

    #[tokio::test]
    async fn test_initialize_with_no_exchanges_is_fatal() {
        let mut settings = settings();
        settings.enabled_exchanges.clear();

        let engine = MonitorEngine::new(settings, RecordingSink::new());
        assert!(engine.initialize().await.is_err());
    }

    #[tokio::test]
    async fn test_price_sink_routes_into_cache() {
        let engine = MonitorEngine::new(settings(), RecordingSink::new());
        let sink = engine.price_sink();

        sink(PriceUpdate::new(
            Exchange::BingX,
            Market::Spot,
            "BTCUSDT",
            30000.0,
        ));

        assert!(engine
            .cache()
            .get(Exchange::BingX, Market::Spot, "BTCUSDT")
            .is_some());
        assert_eq!(engine.stats().prices_received, 1);
    }
}
