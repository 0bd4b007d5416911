//! Job and step models

use super::retry::RetryPolicy;
use fleet_shared::{now_ms, JobId, JobRecord, JobState, Property, StepRecord, StepStatus};
use indexmap::IndexMap;

/// Store key prefix shared by every job record
pub const JOB_KEY_PREFIX: &str = "job/";

/// Store key of a job record
pub fn job_key(id: JobId) -> String {
    format!("{}{}", JOB_KEY_PREFIX, id)
}

/// One step of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobStep {
    pub definition_key: String,
    /// Property values in declaration order
    pub properties: IndexMap<String, String>,
    /// Overrides the configured policy for this step type
    pub retry: Option<RetryPolicy>,
    pub status: StepStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl JobStep {
    pub fn new(definition_key: impl Into<String>) -> Self {
        Self {
            definition_key: definition_key.into(),
            properties: IndexMap::new(),
            retry: None,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    fn to_record(&self) -> StepRecord {
        StepRecord {
            definition_key: self.definition_key.clone(),
            status: self.status.into(),
            attempts: self.attempts,
            last_error: self.last_error.clone().unwrap_or_default(),
            properties: self
                .properties
                .iter()
                .map(|(name, value)| Property {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    fn from_record(record: &StepRecord) -> Self {
        Self {
            definition_key: record.definition_key.clone(),
            properties: record
                .property_pairs()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            retry: None,
            status: record.status(),
            attempts: record.attempts,
            last_error: non_empty(&record.last_error),
        }
    }
}

/// Snapshot of a job
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub target: String,
    pub steps: Vec<JobStep>,
    pub current_step: usize,
    pub state: JobState,
    pub last_error: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Job {
    pub fn new(id: JobId, target: impl Into<String>, steps: Vec<JobStep>) -> Self {
        let now = now_ms();
        Self {
            id,
            target: target.into(),
            steps,
            current_step: 0,
            state: JobState::Created,
            last_error: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current(&self) -> Option<&JobStep> {
        self.steps.get(self.current_step)
    }

    pub fn current_mut(&mut self) -> Option<&mut JobStep> {
        self.steps.get_mut(self.current_step)
    }

    /// Persisted form. Per-step retry overrides are not persisted.
    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id,
            target: self.target.clone(),
            state: self.state.into(),
            current_step: self.current_step as u32,
            steps: self.steps.iter().map(JobStep::to_record).collect(),
            last_error: self.last_error.clone().unwrap_or_default(),
            updated_at_ms: self.updated_at_ms,
        }
    }

    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            target: record.target.clone(),
            steps: record.steps.iter().map(JobStep::from_record).collect(),
            current_step: record.current_step as usize,
            state: record.state(),
            last_error: non_empty(&record.last_error),
            created_at_ms: record.updated_at_ms,
            updated_at_ms: record.updated_at_ms,
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
