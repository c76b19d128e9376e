//! SpreadUP - cross-exchange spot/futures spread monitor.
//!
//! Wires the monitoring engine to a logging notification transport. The
//! production chat layer replaces `LogSender` with a real sender and
//! drives the subscription registry and filter store from its commands.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use spreadup_backend::models::{Exchange, SpreadAlert};
use spreadup_backend::notify::{
    AlertSink, ChatSender, FilterStore, InMemorySubscribers, NotificationService, SendError,
};
use spreadup_backend::{MonitorEngine, Settings};

#[derive(Debug, Parser)]
#[command(name = "spreadup", about = "Cross-exchange spot/futures spread monitor")]
struct Args {
    /// Minimum spread percentage that triggers an alert
    #[arg(long)]
    threshold: Option<f64>,

    /// Comma-separated exchanges to enable (mexc,gateio,bingx,htx)
    #[arg(long)]
    exchanges: Option<String>,

    /// Scan interval in seconds
    #[arg(long)]
    scan_interval: Option<u64>,
}

/// Chat transport that just logs; stands in for the real bot sender.
struct LogSender;

#[async_trait]
impl ChatSender for LogSender {
    async fn send_alert(&self, user_id: i64, alert: &SpreadAlert) -> Result<(), SendError> {
        let opp = &alert.opportunity;
        info!(
            user_id,
            symbol = %opp.symbol,
            spread = opp.spread_percent,
            spot = %format!("{}@{}", opp.spot_exchange, opp.spot_price),
            futures = %format!("{}@{}", opp.futures_exchange, opp.futures_price),
            "alert delivered"
        );
        Ok(())
    }
}

/// Logs every alert the engine emits, then fans it out to subscribers.
struct LoggingSink {
    notifications: Arc<NotificationService>,
}

#[async_trait]
impl AlertSink for LoggingSink {
    async fn deliver(&self, alert: SpreadAlert) -> Result<()> {
        let opp = &alert.opportunity;
        info!(
            symbol = %opp.symbol,
            base = %opp.base_asset,
            spread = opp.spread_percent,
            spot_exchange = %opp.spot_exchange,
            futures_exchange = %opp.futures_exchange,
            volume_24h = opp.volume_24h,
            "spread opportunity detected"
        );
        self.notifications.deliver(alert).await
    }
}

fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(threshold) = args.threshold {
        settings.spread_threshold = threshold;
    }
    if let Some(secs) = args.scan_interval {
        settings.scan_interval = std::time::Duration::from_secs(secs);
    }
    if let Some(raw) = &args.exchanges {
        let exchanges: std::collections::HashSet<Exchange> = raw
            .split(',')
            .filter_map(|s| Exchange::from_str(s).ok())
            .collect();
        if exchanges.is_empty() {
            warn!(raw, "no valid exchange in --exchanges, keeping defaults");
        } else {
            settings.enabled_exchanges = exchanges;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spreadup_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env();
    apply_overrides(&mut settings, &args);

    info!(
        threshold = settings.spread_threshold,
        exchanges = settings.enabled_exchanges.len(),
        scan_interval_secs = settings.scan_interval.as_secs(),
        "starting spreadup"
    );

    let notifications = Arc::new(NotificationService::new(
        Arc::new(LogSender),
        Arc::new(InMemorySubscribers::new()),
        Arc::new(FilterStore::new()),
    ));
    let sink = Arc::new(LoggingSink {
        notifications: notifications.clone(),
    });

    let engine = Arc::new(MonitorEngine::new(settings, sink));
    engine
        .initialize()
        .await
        .context("engine initialization failed")?;
    engine.start().await?;

    info!("spreadup started, waiting for shutdown signal");
    shutdown_signal().await;

    info!("shutdown signal received, stopping");
    engine.stop().await;

    let stats = engine.stats();
    info!(
        prices_received = stats.prices_received,
        opportunities_found = stats.opportunities_found,
        alerts_sent = stats.alerts_sent,
        errors = stats.errors,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
