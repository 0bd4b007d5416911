//! Fleet orchestrator
//!
//! Sends commands to devices over a publish/subscribe transport, correlates
//! their replies under a shared deadline queue, and sequences commands into
//! multi-step jobs whose progress is persisted transactionally.

pub mod command;
pub mod config;
pub mod error;
pub mod job;
pub mod sim;
pub mod steps;
pub mod transport;
pub mod tx;

pub use config::OrchestratorConfig;
pub use error::{FleetError, Result};
