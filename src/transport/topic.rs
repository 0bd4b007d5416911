//! Topic matching and the subscription table shared by channel implementations

use super::traits::{DeliveryCallback, SubscriptionId};
use fleet_shared::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Match a `/`-separated topic against a pattern.
///
/// `+` matches exactly one level, `#` matches every remaining level
/// (including none) and must be last.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    callback: DeliveryCallback,
}

/// Subscriptions registered on one channel
#[derive(Default)]
pub struct Subscriptions {
    next_id: AtomicU64,
    entries: RwLock<Vec<Subscription>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, pattern: &str, callback: DeliveryCallback) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.write().await.push(Subscription {
            id,
            pattern: pattern.to_string(),
            callback,
        });
        id
    }

    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    /// Deliver `message` to every matching subscriber, returning how many matched
    pub async fn dispatch(&self, message: Message) -> usize {
        // Callbacks run without the table lock so they may (un)subscribe.
        let targets: Vec<DeliveryCallback> = self
            .entries
            .read()
            .await
            .iter()
            .filter(|s| topic_matches(&s.pattern, &message.topic))
            .map(|s| s.callback.clone())
            .collect();

        let delivered = targets.len();
        for callback in targets {
            callback(message.clone());
        }
        delivered
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
