//! Publish/subscribe transport abstraction
//!
//! This module handles:
//! - The channel contract the correlator publishes and subscribes through
//! - Topic pattern matching (`+` one level, `#` the rest)
//! - An in-process broker and a framed TCP link

pub mod memory;
pub mod tcp;
pub mod topic;
pub mod traits;

pub use memory::MemoryBroker;
pub use tcp::TcpChannel;
pub use topic::{topic_matches, Subscriptions};
pub use traits::{DeliveryCallback, SubscriptionId, TransportChannel};
