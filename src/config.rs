//! Orchestrator configuration
//!
//! Built once by the composition root and shared read-only (`Arc`) with every
//! component.

use crate::job::RetryPolicy;
use fleet_shared::defaults;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for a correlated request when the caller gives none
    pub request_timeout: Duration,
    /// Deadlines are rounded up to a multiple of this tick
    pub deadline_granularity: Duration,
    /// Retry policy for step types without an entry in `step_retry`
    pub default_retry: RetryPolicy,
    /// Retry policy per step definition key
    pub step_retry: HashMap<String, RetryPolicy>,
    /// Jobs allowed to run steps concurrently
    pub max_concurrent_jobs: usize,
    /// First level of every command/reply topic
    pub topic_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(defaults::REQUEST_TIMEOUT_MS),
            deadline_granularity: Duration::from_millis(defaults::DEADLINE_GRANULARITY_MS),
            default_retry: RetryPolicy::default(),
            step_retry: HashMap::new(),
            max_concurrent_jobs: defaults::MAX_CONCURRENT_JOBS,
            topic_prefix: defaults::TOPIC_PREFIX.into(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_deadline_granularity(mut self, granularity: Duration) -> Self {
        self.deadline_granularity = granularity;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_step_retry(mut self, step_key: impl Into<String>, policy: RetryPolicy) -> Self {
        self.step_retry.insert(step_key.into(), policy);
        self
    }

    pub fn with_max_concurrent_jobs(mut self, jobs: usize) -> Self {
        self.max_concurrent_jobs = jobs.max(1);
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Retry policy for a step type
    pub fn retry_for(&self, step_key: &str) -> &RetryPolicy {
        self.step_retry.get(step_key).unwrap_or(&self.default_retry)
    }

    /// Topic a command of kind `command` is published on for `target`
    pub fn command_topic(&self, target: &str, command: &str) -> String {
        format!("{}/{}/cmd/{}", self.topic_prefix, target, command)
    }

    /// Topic `target` answers on
    pub fn reply_topic(&self, target: &str) -> String {
        format!("{}/{}/reply", self.topic_prefix, target)
    }

    /// Pattern matching the reply topic of every target
    pub fn reply_pattern(&self) -> String {
        format!("{}/+/reply", self.topic_prefix)
    }
}
