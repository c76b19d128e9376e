//! Cross-exchange spread detection.
//!
//! Scans the price cache for symbols listed on both a spot market and a
//! futures market anywhere across the enabled venues, and ranks the
//! contango spreads above the configured threshold.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::cache::PriceCache;
use crate::models::{base_asset, Exchange, Market, SpreadOpportunity};

/// Spreads above this are almost always bad data, not arbitrage.
const MAX_REALISTIC_SPREAD: f64 = 50.0;

pub struct SpreadCalculator {
    cache: Arc<PriceCache>,
    spread_threshold: f64,
}

impl SpreadCalculator {
    pub fn new(cache: Arc<PriceCache>, spread_threshold: f64) -> Self {
        Self {
            cache,
            spread_threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.spread_threshold
    }

    /// `(futures - spot) / spot * 100`, in percent.
    pub fn spread_percent(spot_price: f64, futures_price: f64) -> f64 {
        if spot_price <= 0.0 || futures_price <= 0.0 {
            return 0.0;
        }
        (futures_price - spot_price) / spot_price * 100.0
    }

    fn is_realistic(spread_percent: f64) -> bool {
        spread_percent > 0.0 && spread_percent < MAX_REALISTIC_SPREAD
    }

    /// All opportunities across every (spot venue, futures venue) pair,
    /// sorted by spread descending. `exchanges` restricts both legs when
    /// set. Ties order deterministically by symbol and venue names.
    pub fn find_opportunities(
        &self,
        exchanges: Option<&HashSet<Exchange>>,
    ) -> Vec<SpreadOpportunity> {
        let spot_prices = self.cache.all_by_market(Market::Spot);
        let futures_prices = self.cache.all_by_market(Market::Futures);

        debug!(
            spot_symbols = spot_prices.len(),
            futures_symbols = futures_prices.len(),
            "scanning for spread opportunities"
        );

        let mut opportunities = Vec::new();

        for (symbol, spot_by_exchange) in &spot_prices {
            let Some(futures_by_exchange) = futures_prices.get(symbol) else {
                continue;
            };

            for (spot_exchange, spot) in spot_by_exchange {
                for (futures_exchange, futures) in futures_by_exchange {
                    if let Some(allowed) = exchanges {
                        if !allowed.contains(spot_exchange) || !allowed.contains(futures_exchange)
                        {
                            continue;
                        }
                    }

                    if futures.price <= spot.price {
                        continue;
                    }

                    let spread = Self::spread_percent(spot.price, futures.price);
                    if spread < self.spread_threshold || !Self::is_realistic(spread) {
                        continue;
                    }

                    let detection_latency_ms = match (spot.latency_ms, futures.latency_ms) {
                        (Some(s), Some(f)) => Some(s.max(f)),
                        _ => None,
                    };

                    opportunities.push(SpreadOpportunity {
                        symbol: symbol.clone(),
                        base_asset: base_asset(symbol),
                        spot_exchange: *spot_exchange,
                        spot_price: spot.price,
                        futures_exchange: *futures_exchange,
                        futures_price: futures.price,
                        spread_percent: (spread * 10_000.0).round() / 10_000.0,
                        timestamp: Utc::now(),
                        detection_latency_ms,
                        // Futures volume never overrides the spot side
                        volume_24h: spot.volume_24h,
                    });
                }
            }
        }

        opportunities.sort_by(|a, b| {
            b.spread_percent
                .partial_cmp(&a.spread_percent)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.symbol.cmp(&b.symbol))
                .then_with(|| a.spot_exchange.as_str().cmp(b.spot_exchange.as_str()))
                .then_with(|| a.futures_exchange.as_str().cmp(b.futures_exchange.as_str()))
        });

        if let Some(top) = opportunities.first() {
            debug!(
                count = opportunities.len(),
                max_spread = top.spread_percent,
                "spread scan finished"
            );
        }

        opportunities
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceUpdate;
    use std::time::Duration;

    fn cache() -> Arc<PriceCache> {
        Arc::new(PriceCache::new(Duration::from_secs(300)))
    }

    fn seed(cache: &PriceCache, exchange: Exchange, market: Market, symbol: &str, price: f64) {
        cache.update(PriceUpdate::new(exchange, market, symbol, price));
    }

    #[test]
    fn test_basic_detection() {
        let cache = cache();
        cache.update(
            PriceUpdate::new(Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0)
                .with_volume(100_000_000.0),
        );
        seed(&cache, Exchange::GateIo, Market::Futures, "BTCUSDT", 31200.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        let found = calc.find_opportunities(None);

        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert_eq!(opp.spread_percent, 4.0);
        assert_eq!(opp.base_asset, "BTC");
        assert_eq!(opp.spot_exchange, Exchange::Mexc);
        assert_eq!(opp.futures_exchange, Exchange::GateIo);
        assert_eq!(opp.volume_24h, Some(100_000_000.0));
    }

    #[test]
    fn test_below_threshold_is_empty() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "BTCUSDT", 30300.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        assert!(calc.find_opportunities(None).is_empty());
    }

    #[test]
    fn test_unrealistic_spread_excluded() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "PEPEUSDT", 1.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "PEPEUSDT", 2.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        assert!(calc.find_opportunities(None).is_empty());
    }

    #[test]
    fn test_backwardation_excluded() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "BTCUSDT", 31200.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "BTCUSDT", 30000.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        assert!(calc.find_opportunities(None).is_empty());
    }

    #[test]
    fn test_disjoint_markets_yield_nothing() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "ETHUSDT", 2100.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        assert!(calc.find_opportunities(None).is_empty());
    }

    #[test]
    fn test_deterministic_order_under_ties() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "ETHUSDT", 100.0);
        seed(&cache, Exchange::BingX, Market::Spot, "ETHUSDT", 100.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "ETHUSDT", 105.0);
        seed(&cache, Exchange::Htx, Market::Futures, "ETHUSDT", 105.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        let found = calc.find_opportunities(None);

        assert_eq!(found.len(), 4);
        assert!(found.iter().all(|o| o.spread_percent == 5.0));

        let order: Vec<(Exchange, Exchange)> = found
            .iter()
            .map(|o| (o.spot_exchange, o.futures_exchange))
            .collect();
        assert_eq!(
            order,
            vec![
                (Exchange::BingX, Exchange::GateIo),
                (Exchange::BingX, Exchange::Htx),
                (Exchange::Mexc, Exchange::GateIo),
                (Exchange::Mexc, Exchange::Htx),
            ]
        );
    }

    #[test]
    fn test_sorted_descending_by_spread() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "AUSDT", 100.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "AUSDT", 104.0);
        seed(&cache, Exchange::Mexc, Market::Spot, "BUSDT", 100.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "BUSDT", 110.0);
        seed(&cache, Exchange::Mexc, Market::Spot, "CUSDT", 100.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "CUSDT", 106.0);

        let calc = SpreadCalculator::new(cache, 3.0);
        let found = calc.find_opportunities(None);

        let spreads: Vec<f64> = found.iter().map(|o| o.spread_percent).collect();
        assert_eq!(spreads, vec![10.0, 6.0, 4.0]);
    }

    #[test]
    fn test_exchange_filter_applies_to_both_legs() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0);
        seed(&cache, Exchange::GateIo, Market::Futures, "BTCUSDT", 31200.0);

        let calc = SpreadCalculator::new(cache, 3.0);

        let only_mexc: HashSet<Exchange> = [Exchange::Mexc].into_iter().collect();
        assert!(calc.find_opportunities(Some(&only_mexc)).is_empty());

        let both: HashSet<Exchange> = [Exchange::Mexc, Exchange::GateIo].into_iter().collect();
        assert_eq!(calc.find_opportunities(Some(&both)).len(), 1);
    }

    #[test]
    fn test_latency_is_max_of_both_sides() {
        let cache = cache();
        cache.update(
            PriceUpdate::new(Exchange::Mexc, Market::Spot, "BTCUSDT", 30000.0).with_latency(12.0),
        );
        cache.update(
            PriceUpdate::new(Exchange::GateIo, Market::Futures, "BTCUSDT", 31200.0)
                .with_latency(45.0),
        );

        let calc = SpreadCalculator::new(cache, 3.0);
        let found = calc.find_opportunities(None);
        assert_eq!(found[0].detection_latency_ms, Some(45.0));
    }

    #[test]
    fn test_spread_rounded_to_four_decimals() {
        let cache = cache();
        seed(&cache, Exchange::Mexc, Market::Spot, "XRPUSDT", 0.3);
        seed(&cache, Exchange::GateIo, Market::Futures, "XRPUSDT", 0.31);

        let calc = SpreadCalculator::new(cache, 3.0);
        let found = calc.find_opportunities(None);
        assert_eq!(found[0].spread_percent, 3.3333);
    }
}
