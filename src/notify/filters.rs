//! Per-subscriber filter store.
//!
//! Copy-on-write map: the chat layer mutates single keys while the scan
//! path reads lock-free snapshots, so an update never stalls a fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::models::{Exchange, UserFilters};

type FilterMap = HashMap<i64, Arc<UserFilters>>;

#[derive(Default)]
pub struct FilterStore {
    inner: ArcSwap<FilterMap>,
}

impl FilterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters for a user; defaults if the user never changed anything.
    pub fn get(&self, user_id: i64) -> Arc<UserFilters> {
        self.inner
            .load()
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    /// Publish a new record for one key. The closure may run more than
    /// once if writers race, so it must stay a pure transformation.
    fn update_with(&self, user_id: i64, mutate: impl Fn(&mut UserFilters)) {
        self.inner.rcu(|map| {
            let mut next: FilterMap = (**map).clone();
            let mut filters = next
                .get(&user_id)
                .map(|f| (**f).clone())
                .unwrap_or_default();
            mutate(&mut filters);
            next.insert(user_id, Arc::new(filters));
            next
        });
    }

    pub fn set_min_spread(&self, user_id: i64, value: f64) {
        self.update_with(user_id, |f| f.min_spread = value);
        info!(user_id, value, "updated min spread");
    }

    pub fn set_max_spread(&self, user_id: i64, value: f64) {
        self.update_with(user_id, |f| f.max_spread = value);
        info!(user_id, value, "updated max spread");
    }

    pub fn set_min_volume(&self, user_id: i64, value: f64) {
        self.update_with(user_id, |f| f.min_volume_usd = value);
        info!(user_id, value, "updated min volume");
    }

    pub fn toggle_exchange(&self, user_id: i64, exchange: Exchange) {
        self.update_with(user_id, |f| {
            if !f.enabled_exchanges.remove(&exchange) {
                f.enabled_exchanges.insert(exchange);
            }
        });
        info!(user_id, exchange = %exchange, "toggled exchange");
    }

    pub fn enable_all_exchanges(&self, user_id: i64) {
        self.update_with(user_id, |f| {
            f.enabled_exchanges = Exchange::ALL.into_iter().collect();
        });
    }

    pub fn disable_all_exchanges(&self, user_id: i64) {
        self.update_with(user_id, |f| f.enabled_exchanges.clear());
    }

    pub fn remove(&self, user_id: i64) {
        self.inner.rcu(|map| {
            let mut next: FilterMap = (**map).clone();
            next.remove(&user_id);
            next
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_user_gets_defaults() {
        let store = FilterStore::new();
        let filters = store.get(42);
        assert_eq!(filters.min_spread, 3.0);
        assert_eq!(filters.max_spread, 50.0);
        assert_eq!(filters.enabled_exchanges.len(), 4);
        // Reading never materializes an entry
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_min_spread_publishes_new_record() {
        let store = FilterStore::new();
        store.set_min_spread(42, 5.0);
        assert_eq!(store.get(42).min_spread, 5.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_updates_do_not_leak_across_users() {
        let store = FilterStore::new();
        store.set_min_spread(1, 7.0);
        assert_eq!(store.get(2).min_spread, 3.0);
    }

    #[test]
    fn test_toggle_exchange_round_trip() {
        let store = FilterStore::new();
        store.toggle_exchange(1, Exchange::Htx);
        assert!(!store.get(1).enabled_exchanges.contains(&Exchange::Htx));
        store.toggle_exchange(1, Exchange::Htx);
        assert!(store.get(1).enabled_exchanges.contains(&Exchange::Htx));
    }

    #[test]
    fn test_disable_then_enable_all() {
        let store = FilterStore::new();
        store.disable_all_exchanges(1);
        assert!(store.get(1).enabled_exchanges.is_empty());
        store.enable_all_exchanges(1);
        assert_eq!(store.get(1).enabled_exchanges.len(), 4);
    }

    #[test]
    fn test_reader_snapshot_is_stable_across_writes() {
        let store = FilterStore::new();
        store.set_min_spread(1, 4.0);
        let snapshot = store.get(1);
        store.set_min_spread(1, 9.0);
        // The old snapshot is unchanged, the new one reflects the write
        assert_eq!(snapshot.min_spread, 4.0);
        assert_eq!(store.get(1).min_spread, 9.0);
    }
}
