//! Correlated command dispatch
//!
//! This module handles:
//! - Assigning correlation keys and tracking pending requests
//! - Matching inbound replies to their requests (first settlement wins)
//! - Deadline supervision through a single shared deadline queue
//! - Cancellation per job and failure on channel teardown

mod correlator;
mod timeout;

pub use correlator::{Correlator, CorrelatorStats, PendingHandle, Request, Response};
pub use timeout::{TimeoutCallback, TimeoutSupervisor, MAX_TIMEOUT};
