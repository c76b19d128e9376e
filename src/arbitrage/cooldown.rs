//! Per-asset alert cooldown.
//!
//! One alert per base asset per window, whatever the exchange pair: a 5%
//! BTC spread across any two venues is one economic event.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

pub struct AlertCooldown {
    window: Duration,
    last_emitted: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic check-and-stamp: returns true and records `now` iff the key
    /// is outside its cooldown window. A suppressed call never mutates.
    pub fn may_emit(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut map = self.last_emitted.lock();

        if let Some(last) = map.get(key) {
            let elapsed = now.signed_duration_since(*last);
            let within_window = match elapsed.to_std() {
                Ok(elapsed) => elapsed < self.window,
                // Negative elapsed (clock skew): stay suppressed
                Err(_) => true,
            };
            if within_window {
                return false;
            }
        }

        map.insert(key.to_string(), now);
        true
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_emitted.lock().len()
    }
}
