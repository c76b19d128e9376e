//! SpreadUP Backend Library
//!
//! Cross-exchange spot/futures spread monitor: exchange connectors feed a
//! shared price cache, a scan loop ranks contango spreads and pushes
//! rate-limited alerts to the notification layer.

pub mod arbitrage;
pub mod cache;
pub mod config;
pub mod exchanges;
pub mod limits;
pub mod models;
pub mod notify;

pub use arbitrage::{AlertCooldown, MonitorEngine, SpreadCalculator};
pub use cache::PriceCache;
pub use config::Settings;
pub use models::{Exchange, Market, PriceUpdate, SpreadAlert, SpreadOpportunity, UserFilters};
