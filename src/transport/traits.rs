//! Transport trait abstraction for pluggable pub/sub backends

use crate::error::Result;
use async_trait::async_trait;
use fleet_shared::Message;
use std::sync::Arc;

pub type SubscriptionId = u64;

/// Invoked on the channel's delivery task for every matching message.
///
/// Callbacks must not block: the delivery task is shared by all subscribers.
pub type DeliveryCallback = Arc<dyn Fn(Message) + Send + Sync>;

#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Hand a message to the transport. `Ok` means the transport accepted it,
    /// not that any subscriber received it.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Register `callback` for every inbound message whose topic matches `pattern`
    async fn subscribe(&self, pattern: &str, callback: DeliveryCallback) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId);

    /// Resolves once the channel has been torn down
    async fn closed(&self);

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
