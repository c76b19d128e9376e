//! Alert delivery.
//!
//! The engine publishes through the [`AlertSink`] trait; the concrete
//! [`NotificationService`] checks each subscriber's filters and fans the
//! send out in parallel, isolating per-subscriber failures. The actual
//! chat transport sits behind [`ChatSender`] and is provided by the outer
//! application.

pub mod filters;

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::models::SpreadAlert;

pub use filters::FilterStore;

/// Where the engine hands off detected opportunities.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: SpreadAlert) -> Result<()>;
}

/// Delivery failure categories reported by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The subscriber permanently blocked the bot; drop them.
    Blocked,
    /// Anything transient or unknown.
    Failed(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Blocked => f.write_str("subscriber blocked the bot"),
            SendError::Failed(reason) => write!(f, "send failed: {reason}"),
        }
    }
}

impl std::error::Error for SendError {}

/// Downstream chat transport (Telegram in production, mocks in tests).
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_alert(&self, user_id: i64, alert: &SpreadAlert) -> Result<(), SendError>;
}

/// Read-mostly view of who gets alerts. Written by the chat command layer,
/// read by the notification fan-out.
pub trait SubscriptionRegistry: Send + Sync {
    fn list_subscribers(&self) -> Vec<i64>;
    fn remove(&self, user_id: i64);
}

/// In-memory subscriber set.
#[derive(Default)]
pub struct InMemorySubscribers {
    users: RwLock<HashSet<i64>>,
}

impl InMemorySubscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: i64) {
        if self.users.write().insert(user_id) {
            info!(user_id, "user subscribed");
        }
    }

    pub fn unsubscribe(&self, user_id: i64) {
        if self.users.write().remove(&user_id) {
            info!(user_id, "user unsubscribed");
        }
    }

    pub fn is_subscribed(&self, user_id: i64) -> bool {
        self.users.read().contains(&user_id)
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

impl SubscriptionRegistry for InMemorySubscribers {
    fn list_subscribers(&self) -> Vec<i64> {
        self.users.read().iter().copied().collect()
    }

    fn remove(&self, user_id: i64) {
        self.users.write().remove(&user_id);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NotificationStats {
    pub subscribers: usize,
    pub notifications_sent: u64,
    pub notifications_failed: u64,
    pub filtered_out: u64,
}

/// Fans alerts out to all subscribers that pass their own filters.
pub struct NotificationService {
    sender: Arc<dyn ChatSender>,
    registry: Arc<InMemorySubscribers>,
    filters: Arc<FilterStore>,
    sent: AtomicU64,
    failed: AtomicU64,
    filtered_out: AtomicU64,
}

impl NotificationService {
    pub fn new(
        sender: Arc<dyn ChatSender>,
        registry: Arc<InMemorySubscribers>,
        filters: Arc<FilterStore>,
    ) -> Self {
        Self {
            sender,
            registry,
            filters,
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<InMemorySubscribers> {
        &self.registry
    }

    pub fn filters(&self) -> &Arc<FilterStore> {
        &self.filters
    }

    async fn send_to_user(&self, user_id: i64, alert: &SpreadAlert) {
        match self.sender.send_alert(user_id, alert).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(SendError::Blocked) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.registry.remove(user_id);
                info!(user_id, "removed blocked subscriber");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(user_id, error = %e, "failed to send notification");
            }
        }
    }

    pub fn stats(&self) -> NotificationStats {
        NotificationStats {
            subscribers: self.registry.len(),
            notifications_sent: self.sent.load(Ordering::Relaxed),
            notifications_failed: self.failed.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl AlertSink for NotificationService {
    async fn deliver(&self, alert: SpreadAlert) -> Result<()> {
        let subscribers = self.registry.list_subscribers();
        if subscribers.is_empty() {
            return Ok(());
        }

        let opp = &alert.opportunity;
        let mut sends = Vec::new();
        for user_id in subscribers {
            let filters = self.filters.get(user_id);
            if !filters.accepts(opp) {
                self.filtered_out.fetch_add(1, Ordering::Relaxed);
                debug!(
                    user_id,
                    symbol = %opp.symbol,
                    spread = opp.spread_percent,
                    "alert filtered out for user"
                );
                continue;
            }
            sends.push(self.send_to_user(user_id, &alert));
        }

        // Parallel fan-out; each send handles its own failure.
        join_all(sends).await;
        Ok(())
    }
}
