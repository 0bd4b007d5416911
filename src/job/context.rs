//! What a step behaviour sees while it runs

use super::registry::StepDefinition;
use crate::command::{Correlator, PendingHandle, Request, Response};
use crate::config::OrchestratorConfig;
use crate::error::{FleetError, Result};
use crate::tx::TransactionManager;
use bytes::Bytes;
use fleet_shared::JobId;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;

/// Context for one attempt of one step.
///
/// Every request sent through it is owned by the job, so stopping the job
/// cancels whatever the step is still waiting on.
pub struct StepContext {
    job_id: JobId,
    target: String,
    step_index: usize,
    attempt: u32,
    definition: Arc<StepDefinition>,
    /// Declared properties only
    properties: IndexMap<String, String>,
    correlator: Arc<Correlator>,
    transactions: Arc<TransactionManager>,
    config: Arc<OrchestratorConfig>,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_id: JobId,
        target: String,
        step_index: usize,
        attempt: u32,
        definition: Arc<StepDefinition>,
        properties: IndexMap<String, String>,
        correlator: Arc<Correlator>,
        transactions: Arc<TransactionManager>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            job_id,
            target,
            step_index,
            attempt,
            definition,
            properties,
            correlator,
            transactions,
            config,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn definition_key(&self) -> &str {
        self.definition.key()
    }

    pub fn properties(&self) -> &IndexMap<String, String> {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// A declared property that must be present
    pub fn require(&self, name: &str) -> Result<&str> {
        self.property(name).ok_or_else(|| FleetError::MissingProperty {
            step: self.definition.key().to_string(),
            property: name.to_string(),
        })
    }

    /// Send `command` to the job's target and wait with the default timeout
    pub async fn request(&self, command: &str, payload: impl Into<Bytes>) -> Result<Response> {
        self.request_with_timeout(command, payload, self.config.request_timeout)
            .await
    }

    pub async fn request_with_timeout(
        &self,
        command: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Response> {
        self.send(command, payload, timeout).await?.wait().await
    }

    /// Send without waiting, for steps that issue requests concurrently
    pub async fn send(
        &self,
        command: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<PendingHandle> {
        let request = Request::new(self.target.clone(), command, payload).owned_by(self.job_id);
        self.correlator.send(request, timeout).await
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}
