//! Multi-step job orchestration
//!
//! This module handles:
//! - Job and step models and their persisted records
//! - The step definition registry contributed by step modules
//! - The executor that runs steps in order with per-step retry, stop
//!   handling and commit-gated status publication

mod context;
mod executor;
mod model;
mod registry;
mod retry;

pub use context::StepContext;
pub use executor::{JobExecutor, JobNotice};
pub use model::{job_key, Job, JobStep, JOB_KEY_PREFIX};
pub use registry::{StepBehavior, StepDefinition, StepRegistry, StepRegistryBuilder};
pub use retry::{Backoff, RetryPolicy};
