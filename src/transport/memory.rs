//! In-process broker
//!
//! Publishes are queued and delivered by a dedicated task, so subscribers
//! always run on a different execution context than the publisher.

use super::topic::Subscriptions;
use super::traits::{DeliveryCallback, SubscriptionId, TransportChannel};
use crate::error::{FleetError, Result};
use async_trait::async_trait;
use fleet_shared::Message;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct MemoryBroker {
    subscriptions: Arc<Subscriptions>,
    inbox_tx: mpsc::UnboundedSender<Message>,
    /// Cleared to simulate an outage; publishes fail until it is set again
    available: AtomicBool,
    closed_tx: watch::Sender<bool>,
    delivery: JoinHandle<()>,
}

impl MemoryBroker {
    /// Create a broker and start its delivery task
    pub fn new() -> Self {
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, _) = watch::channel(false);
        let subscriptions = Arc::new(Subscriptions::new());

        let subs = subscriptions.clone();
        let delivery = tokio::spawn(async move {
            while let Some(message) = inbox_rx.recv().await {
                let topic = message.topic.clone();
                let delivered = subs.dispatch(message).await;
                if delivered == 0 {
                    debug!("[TRANSPORT] No subscriber for {}", topic);
                }
            }
        });

        Self {
            subscriptions,
            inbox_tx,
            available: AtomicBool::new(true),
            closed_tx,
            delivery,
        }
    }

    /// Toggle availability; while unavailable every publish is refused
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Tear the broker down. Queued messages are dropped.
    pub fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        self.available.store(false, Ordering::SeqCst);
        self.delivery.abort();
        info!("[TRANSPORT] Memory broker closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        self.delivery.abort();
    }
}

#[async_trait]
impl TransportChannel for MemoryBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(FleetError::channel(&message.topic, "broker closed"));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(FleetError::channel(&message.topic, "broker unavailable"));
        }

        let topic = message.topic.clone();
        self.inbox_tx
            .send(message)
            .map_err(|_| FleetError::channel(topic, "delivery task stopped"))
    }

    async fn subscribe(&self, pattern: &str, callback: DeliveryCallback) -> Result<SubscriptionId> {
        if self.is_closed() {
            return Err(FleetError::channel(pattern, "broker closed"));
        }
        Ok(self.subscriptions.add(pattern, callback).await)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.remove(id).await;
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
