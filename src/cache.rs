//! Latest-price cache shared by connectors and the spread scanner.
//!
//! Concurrent map keyed by `exchange:market:symbol` with per-entry TTL.
//! Writers are the connector feed loops, readers the scan loop; short
//! critical sections only, so a parking_lot RwLock is enough.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::models::{Exchange, Market, PriceUpdate};

struct CacheEntry {
    update: PriceUpdate,
    expires_at: Instant,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub updates: u64,
}

pub struct PriceCache {
    ttl: Duration,
    inner: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
}

impl PriceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            updates: AtomicU64::new(0),
        }
    }

    /// Upsert the latest price for its `exchange:market:symbol` key.
    /// Last wall-clock writer wins; source timestamps may move backwards.
    pub fn update(&self, update: PriceUpdate) {
        let key = update.key();
        let entry = CacheEntry {
            update,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.write().insert(key, entry);
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Latest price for the key, or `None` once the entry expired.
    pub fn get(&self, exchange: Exchange, market: Market, symbol: &str) -> Option<PriceUpdate> {
        let key = format!("{exchange}:{market}:{symbol}");
        let now = Instant::now();

        {
            let map = self.inner.read();
            match map.get(&key) {
                Some(entry) if now < entry.expires_at => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.update.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Entry was present but stale: evict it lazily.
        let mut map = self.inner.write();
        if let Some(entry) = map.get(&key) {
            if now >= entry.expires_at {
                map.remove(&key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Snapshot of all live prices for one market, grouped
    /// `symbol -> exchange -> update`. Taken under a single read lock so
    /// every symbol's view is consistent at one point in time.
    pub fn all_by_market(&self, market: Market) -> HashMap<String, HashMap<Exchange, PriceUpdate>> {
        let now = Instant::now();
        let map = self.inner.read();

        let mut result: HashMap<String, HashMap<Exchange, PriceUpdate>> = HashMap::new();
        for entry in map.values() {
            if entry.update.market != market || now >= entry.expires_at {
                continue;
            }
            result
                .entry(entry.update.symbol.clone())
                .or_default()
                .insert(entry.update.exchange, entry.update.clone());
        }
        result
    }

    /// Remove expired entries. Idempotent; safe alongside concurrent updates.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, entry| now < entry.expires_at);
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired cache entries");
        }
    }

    /// Drop everything (shutdown path).
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.read().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
        }
    }
}
